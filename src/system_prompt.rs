//! System prompt construction
//!
//! The dialog model is told to answer in a fixed JSON shape and is given the
//! supported diseases with their parameter ranges, rendered from the registry
//! so the prompt never drifts from what the workflow validates.

use crate::parameters::{DiseaseSchema, ParameterRegistry};
use std::collections::BTreeMap;
use std::fmt::Write;

const RESPONSE_FORMAT: &str = r#"Always respond in this JSON format:
{"intent": "<intent>", "entities": [], "confidence": 1.0, "response": "<your response>"}"#;

const BASE_PROMPT: &str = r"You are a helpful medical assistant.

- Greet users warmly and ask open-ended health questions.
- Use clear, plain language and show empathy.
- Suggest possible explanations, never diagnoses, and conclude with actionable next steps.
- Keep the current health concern as the topic unless the user asks to change it.";

const INTENTS: &str = r#"## INTENTS
Use one of these intents when it applies, otherwise a short descriptive intent such as "greeting" or "symptom_analysis":
- start_prediction: the user wants a risk prediction. Put the disease name in entities.
- update_parameter: the user gives one or more parameter values. Put each as "name=value" in entities.
- delete_parameter: the user wants a value removed. Put the parameter names in entities.
- confirm_prediction: the user confirms the collected values and wants the result.
- cancel_prediction: the user abandons the prediction."#;

const WORKFLOW: &str = r"## DISEASE PREDICTION WORKFLOW
1. Collect the disease parameters one at a time, in the order listed below.
2. When all values are present, list them and ask the user to confirm, edit or cancel.
3. Never invent a value the user did not give.";

/// Build the system prompt for the dialog model
pub fn build_system_prompt(registry: &ParameterRegistry) -> String {
    let mut prompt = String::from(RESPONSE_FORMAT);
    prompt.push_str("\n\n");
    prompt.push_str(BASE_PROMPT);
    prompt.push_str("\n\n");
    prompt.push_str(INTENTS);
    prompt.push_str("\n\n");
    prompt.push_str(WORKFLOW);
    prompt.push_str("\n\n## SUPPORTED DISEASES\n");

    for disease in registry.diseases() {
        let Some(schema) = registry.schema(disease) else {
            continue;
        };
        let _ = writeln!(prompt, "\n### {disease}");
        for spec in schema.parameters() {
            let _ = write!(
                prompt,
                "- {}: {} ({} to {}",
                spec.name, spec.description, spec.lo, spec.hi
            );
            if !spec.unit.is_empty() {
                let _ = write!(prompt, " {}", spec.unit);
            }
            prompt.push_str(")\n");
        }
    }

    prompt
}

/// Message asking the dialog model for guidance on an updated prediction.
/// The reply's `follow_up_questions` and `recommendations` lists are kept.
pub fn guidance_request(schema: &DiseaseSchema, parameters: &BTreeMap<String, String>) -> String {
    let mut message = format!(
        "Update prediction parameters for {}. Reply with \"follow_up_questions\" and \"recommendations\" lists alongside the usual fields.\n",
        schema.disease
    );
    for spec in schema.parameters() {
        if let Some(value) = parameters.get(spec.name) {
            let _ = writeln!(message, "- {}: {value}", spec.name);
        }
    }
    message
}
