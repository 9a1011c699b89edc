use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, warn};

use baton_core::{
    BatonError, BlobFetcher, CallOptions, ChatMessage, DataSource, Result, StatusEvent, StepKind,
    StreamEvent, Workflow, WorkflowStep,
};
use baton_llm::BoundLlm;
use baton_stream::{Collector, Multiplexer};

use crate::strategy::{Assistant, StrategyContext, StrategyOutcome};

/// A named mutable cell scoped to one workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Text(String),
    /// Intermediate lists stay explicit sequences of strings.
    List(Vec<String>),
    Source(DataSource),
}

impl SlotValue {
    pub fn as_json(&self) -> Value {
        match self {
            SlotValue::Text(s) => json!(s),
            SlotValue::List(items) => json!(items),
            SlotValue::Source(ds) => json!(ds.id),
        }
    }
}

/// Interprets a workflow document: binds step inputs from slots and external
/// sources, dispatches prompt/map/reduce operations through the canonical
/// client, and binds each output back to its slot.
pub struct WorkflowExecutor<'a> {
    llm: &'a BoundLlm,
    mux: &'a std::sync::Arc<Multiplexer>,
    fetcher: Option<&'a dyn BlobFetcher>,
    kill: &'a (dyn Fn() -> bool + Send + Sync),
    options: CallOptions,
    forwarder: std::sync::Arc<crate::strategies::MuxForwarder>,
}

impl<'a> WorkflowExecutor<'a> {
    pub fn from_context(ctx: &'a StrategyContext<'_>) -> Self {
        let mut options = ctx.base_options.clone();
        // Workflow steps never recurse into retrieval.
        options.skip_rag = true;
        Self {
            llm: ctx.llm,
            mux: ctx.mux,
            fetcher: ctx.fetcher,
            kill: ctx.kill,
            options,
            forwarder: ctx.status_forwarder(),
        }
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        initial: HashMap<String, SlotValue>,
    ) -> Result<Option<StrategyOutcome>> {
        let mut slots = initial;

        for (step_index, step) in workflow.steps.iter().enumerate() {
            // Safe point between steps.
            if (self.kill)() {
                debug!(step_index, "kill switch observed, ending workflow");
                self.mux.forward(StreamEvent::end()).await?;
                return Ok(None);
            }

            let status_id = format!("workflow:{step_index}");
            if let Some(message) = &step.status_message {
                self.mux
                    .status(StatusEvent::running(&status_id, message.clone()))
                    .await?;
            }

            let inputs = match self.resolve_inputs(step, &slots).await {
                Ok(inputs) => inputs,
                Err(e) => {
                    return Ok(Some(StrategyOutcome {
                        status: 500,
                        body: json!({"error": e.to_string(), "step_index": step_index}),
                    }));
                }
            };

            let output = match self.execute_step(step, &inputs).await {
                Ok(output) => output,
                Err(BatonError::Cancelled) => {
                    self.mux.forward(StreamEvent::end()).await?;
                    return Ok(None);
                }
                Err(e) => {
                    warn!(step_index, error = %e, "workflow step failed");
                    return Ok(Some(StrategyOutcome {
                        status: 500,
                        body: json!({"error": e.to_string(), "step_index": step_index}),
                    }));
                }
            };
            slots.insert(step.output_to.clone(), output);

            if let Some(message) = &step.status_message {
                self.mux
                    .status(StatusEvent::done(&status_id, message.clone()))
                    .await?;
            }
        }

        let result = match &workflow.result_key {
            Some(key) => slots
                .get(key)
                .map(SlotValue::as_json)
                .unwrap_or(Value::Null),
            None => Value::Object(
                slots
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_json()))
                    .collect(),
            ),
        };
        self.mux
            .forward(StreamEvent::Result { value: result })
            .await?;
        self.mux.forward(StreamEvent::end()).await?;
        Ok(None)
    }

    /// Bind step inputs: a known slot name yields the slot's value, anything
    /// else is treated as an external data source reference.
    async fn resolve_inputs(
        &self,
        step: &WorkflowStep,
        slots: &HashMap<String, SlotValue>,
    ) -> Result<Vec<String>> {
        let mut texts = Vec::new();
        for name in &step.input {
            let value = match slots.get(name) {
                Some(value) => value.clone(),
                None => {
                    let ds = DataSource::new(name.clone());
                    if let Some(slot) = ds.object_name() {
                        match slots.get(slot) {
                            Some(value) => value.clone(),
                            None => {
                                return Err(BatonError::InvalidRequest(format!(
                                    "unbound workflow slot: {slot}"
                                )));
                            }
                        }
                    } else {
                        SlotValue::Source(ds)
                    }
                }
            };
            match value {
                SlotValue::Text(text) => texts.push(text),
                SlotValue::List(items) => texts.extend(items),
                SlotValue::Source(ds) => {
                    let Some(fetcher) = self.fetcher else {
                        return Err(BatonError::InvalidRequest(format!(
                            "no content access for {}",
                            ds.id
                        )));
                    };
                    texts.push(fetcher.fetch(&ds).await?.text());
                }
            }
        }
        Ok(texts)
    }

    async fn execute_step(&self, step: &WorkflowStep, inputs: &[String]) -> Result<SlotValue> {
        match step.kind {
            StepKind::Prompt => {
                let text = self.call(&step.body, &inputs.join("\n\n")).await?;
                Ok(SlotValue::Text(text))
            }
            StepKind::Map => {
                let mut outputs = Vec::with_capacity(inputs.len());
                for input in inputs {
                    if (self.kill)() {
                        return Err(BatonError::Cancelled);
                    }
                    outputs.push(self.call(&step.body, input).await?);
                }
                Ok(SlotValue::List(outputs))
            }
            StepKind::Reduce => {
                let mut items: Vec<String> = inputs.to_vec();
                while items.len() > 2 {
                    let mut next = Vec::with_capacity(items.len().div_ceil(2));
                    for pair in items.chunks(2) {
                        if pair.len() == 1 {
                            next.push(pair[0].clone());
                            continue;
                        }
                        if (self.kill)() {
                            return Err(BatonError::Cancelled);
                        }
                        next.push(
                            self.call(&step.body, &format!("{}\n\n{}", pair[0], pair[1]))
                                .await?,
                        );
                    }
                    items = next;
                }
                let text = self.call(&step.body, &items.join("\n\n")).await?;
                Ok(SlotValue::Text(text))
            }
        }
    }

    /// One LLM call, buffered through a collector so the partial result can
    /// be bound to the slot while progress events still reach the client.
    async fn call(&self, body: &str, input: &str) -> Result<String> {
        let messages = if input.is_empty() {
            vec![ChatMessage::user(body.to_string())]
        } else {
            vec![
                ChatMessage::system(body.to_string()),
                ChatMessage::user(input.to_string()),
            ]
        };
        let collector = Collector::new(self.forwarder.clone());
        let reply = self.llm.chat(&messages, &self.options, collector.as_ref()).await?;
        if let Some((code, text)) = collector.error() {
            return Err(BatonError::Provider {
                provider: code.to_string(),
                message: text,
            });
        }
        Ok(reply.content)
    }
}

/// Strategy wrapper dispatching to the executor.
pub struct WorkflowStrategy;

#[async_trait::async_trait]
impl Assistant for WorkflowStrategy {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn handle(&self, ctx: &StrategyContext<'_>) -> Result<Option<StrategyOutcome>> {
        let Some(workflow) = &ctx.request.options.workflow else {
            return Ok(Some(StrategyOutcome::error(
                400,
                "workflow strategy selected without a workflow document",
            )));
        };
        let mut initial = HashMap::new();
        if let Some(text) = ctx.request.last_user_text() {
            initial.insert("user_input".to_string(), SlotValue::Text(text));
        }
        for source in &ctx.sources.objects {
            if let Some(name) = source.object_name() {
                initial.insert(name.to_string(), SlotValue::Source(source.clone()));
            }
        }
        WorkflowExecutor::from_context(ctx).run(workflow, initial).await
    }
}
