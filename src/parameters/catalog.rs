//! Built-in clinical parameter tables

use super::{DiseaseType, ParameterSpec as P};

const DIABETES: &[P] = &[
    P::new("pregnancy_count", "Number of times pregnant", 0.0, 20.0, "times"),
    P::new("glucose_level", "Plasma glucose concentration", 0.0, 200.0, "mg/dL"),
    P::new("blood_pressure", "Diastolic blood pressure", 0.0, 150.0, "mmHg"),
    P::new("skin_thickness", "Triceps skin fold thickness", 0.0, 50.0, "mm"),
    P::new("insulin", "2-Hour serum insulin", 0.0, 900.0, "mu U/ml"),
    P::new("bmi", "Body mass index", 0.0, 50.0, "kg/m²"),
    P::new("diabetes_pedigree", "Diabetes pedigree function", 0.0, 2.5, "score"),
    P::new("age", "Age of the patient", 21.0, 90.0, "years"),
];

const HEART: &[P] = &[
    P::new("age", "Age of the patient", 29.0, 77.0, "years"),
    P::new("sex", "Sex of the patient", 0.0, 1.0, "binary (0=female, 1=male)"),
    P::new("chest_pain_type", "Type of chest pain", 0.0, 3.0, "categorical"),
    P::new("resting_blood_pressure", "Resting blood pressure", 94.0, 200.0, "mmHg"),
    P::new("cholesterol", "Serum cholesterol", 126.0, 564.0, "mg/dL"),
    P::new("fasting_blood_sugar", "Fasting blood sugar > 120 mg/dL", 0.0, 1.0, "binary"),
    P::new("resting_ecg", "Resting electrocardiographic results", 0.0, 2.0, "categorical"),
    P::new("max_heart_rate", "Maximum heart rate achieved", 71.0, 202.0, "bpm"),
    P::new("exercise_induced_angina", "Exercise-induced angina", 0.0, 1.0, "binary"),
    P::new(
        "st_depression",
        "ST depression induced by exercise relative to rest",
        0.0,
        6.2,
        "mm",
    ),
    P::new("st_slope", "The slope of the peak exercise ST segment", 0.0, 2.0, "categorical"),
];

const PARKINSONS: &[P] = &[
    P::new("mdvp_fo", "Average vocal fundamental frequency", 88.45, 260.41, "Hz"),
    P::new("mdvp_fhi", "Maximum vocal fundamental frequency", 102.15, 592.03, "Hz"),
    P::new("mdvp_flo", "Minimum vocal fundamental frequency", 65.47, 239.17, "Hz"),
    P::new("jitter_percent", "Percent of period-to-period variations", 0.0, 0.1, "%"),
    P::new("jitter_abs", "Absolute jitter in microseconds", 0.0, 0.012, "microseconds"),
    P::new("shimmer", "Amplitude variations in the voice signal", 0.009, 0.2, "dB"),
    P::new("nhr", "Noise-to-harmonic ratio", 0.001, 0.3, "ratio"),
    P::new("rpde", "Recurrence period density entropy", 0.1, 0.9, "score"),
    P::new("spread1", "Nonlinear dynamical complexity measure", -7.2, 2.0, "score"),
];

const KIDNEY: &[P] = &[
    P::new("age", "Age of the patient", 4.0, 90.0, "years"),
    P::new("blood_pressure", "Blood pressure", 50.0, 180.0, "mmHg"),
    P::new("specific_gravity", "Specific gravity of urine", 1.005, 1.030, "g/mL"),
    P::new("albumin", "Albumin levels in urine", 0.0, 5.0, "scale"),
    P::new("sugar", "Sugar levels in urine", 0.0, 5.0, "scale"),
    P::new("red_blood_cells", "Red blood cells in urine", 0.0, 5.0, "scale"),
    P::new("pus_cell", "Pus cells in urine", 0.0, 5.0, "scale"),
    P::new("pus_cell_clumps", "Pus cell clumps in urine", 0.0, 1.0, "binary"),
];

const LIVER: &[P] = &[
    P::new("age", "Age of the patient", 4.0, 90.0, "years"),
    P::new("total_bilirubin", "Total bilirubin", 0.4, 75.0, "mg/dL"),
    P::new("direct_bilirubin", "Direct bilirubin", 0.1, 19.7, "mg/dL"),
    P::new("alkaline_phosphatase", "Alkaline phosphatase", 63.0, 2000.0, "U/L"),
    P::new("alanine_aminotransferase", "Alanine aminotransferase (ALT)", 7.0, 75.0, "U/L"),
    P::new("aspartate_aminotransferase", "Aspartate aminotransferase (AST)", 7.0, 75.0, "U/L"),
    P::new("total_proteins", "Total proteins", 4.6, 8.3, "g/dL"),
    P::new("albumin", "Albumin", 3.4, 5.4, "g/dL"),
];

const BREAST_CANCER: &[P] = &[
    P::new(
        "radius_mean",
        "Mean of distances from center to points on the perimeter",
        6.5,
        28.0,
        "mm",
    ),
    P::new("texture_mean", "Standard deviation of gray-scale values", 9.5, 39.0, "value"),
    P::new("perimeter_mean", "Mean size of the breast mass", 43.0, 189.0, "mm"),
    P::new("area_mean", "Mean area of the breast mass", 143.0, 2501.0, "mm²"),
    P::new("smoothness_mean", "Local variation in radius lengths", 0.05, 0.16, "score"),
    P::new("compactness_mean", "Perimeter² / area - 1.0", 0.02, 0.35, "score"),
    P::new("concavity_mean", "Severity of concave portions of the contour", 0.0, 0.43, "score"),
];

pub(super) fn parameters_for(disease: DiseaseType) -> &'static [P] {
    match disease {
        DiseaseType::Diabetes => DIABETES,
        DiseaseType::Heart => HEART,
        DiseaseType::Parkinsons => PARKINSONS,
        DiseaseType::Kidney => KIDNEY,
        DiseaseType::Liver => LIVER,
        DiseaseType::BreastCancer => BREAST_CANCER,
    }
}
