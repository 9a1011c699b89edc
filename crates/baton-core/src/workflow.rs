use serde::{Deserialize, Serialize};

/// How one workflow step consumes its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// One LLM call over the joined inputs.
    Prompt,
    /// One LLM call per input; the output slot holds the list of responses.
    Map,
    /// Pairwise reduction of the input collection down to a single text.
    Reduce,
}

/// One step of a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub kind: StepKind,
    /// Slot names or external data-source ids.
    #[serde(default)]
    pub input: Vec<String>,
    /// The prompt text driving this step.
    pub body: String,
    #[serde(default, alias = "outputTo")]
    pub output_to: String,
    #[serde(default, alias = "statusMessage", skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

/// A step-graph of prompt/map/reduce operations over named slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
    #[serde(default, alias = "resultKey", skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_document_deserializes() {
        let doc = serde_json::json!({
            "steps": [
                {
                    "kind": "map",
                    "input": ["s3://u@x.com/report.pdf"],
                    "body": "Summarize this section.",
                    "outputTo": "summaries",
                    "statusMessage": "Summarizing sections",
                },
                {
                    "kind": "reduce",
                    "input": ["summaries"],
                    "body": "Combine the summaries.",
                    "outputTo": "final",
                },
            ],
            "resultKey": "final",
        });
        let wf: Workflow = serde_json::from_value(doc).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[0].kind, StepKind::Map);
        assert_eq!(wf.steps[1].output_to, "final");
        assert_eq!(wf.result_key.as_deref(), Some("final"));
    }
}
