//! The payload document: identity, processing steps, and data records.
//!
//! A payload is the validated, immutable-until-chained work item. It is
//! constructed from an inbound message (or from stored state), consumed
//! read-only by the dispatch protocol, and superseded by chained payloads
//! when it completes (see [`crate::chain`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stratus_core::PayloadId;

use crate::chain::ChainFilter;
use crate::error::{Error, Result};

/// One geospatial data record carried by a payload.
///
/// The `links` list is required on the wire: a record without one fails
/// deserialization, so every constructed record carries a (possibly empty)
/// list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Record identifier within its collection.
    pub id: String,
    /// Source collection name.
    pub collection: String,
    /// Related-resource links. Required, possibly empty.
    pub links: Vec<Value>,
    /// Free-form record properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Record {
    /// Creates a record with an empty link list and no properties.
    #[must_use]
    pub fn new(id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            links: Vec::new(),
            properties: Map::new(),
        }
    }

    /// Returns a numeric property value, if present and numeric.
    #[must_use]
    pub fn numeric_property(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }

    /// Returns the canonical link href, if the record carries one.
    #[must_use]
    pub fn canonical_link(&self) -> Option<&str> {
        self.links.iter().find_map(|link| {
            let rel = link.get("rel").and_then(Value::as_str)?;
            if rel == "canonical" {
                link.get("href").and_then(Value::as_str)
            } else {
                None
            }
        })
    }
}

/// One processing step of a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStep {
    /// Name of the workflow the execution engine should run.
    pub workflow: String,
    /// Re-dispatch even when the stored state is terminal.
    #[serde(default)]
    pub replace: bool,
    /// Explicit collections override for identity derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,
    /// Task configuration forwarded to the workflow, opaque to orchestration.
    #[serde(default)]
    pub task_options: Map<String, Value>,
    /// Restricts which records carry forward when this step is chained into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_filter: Option<ChainFilter>,
}

impl ProcessStep {
    /// Creates a step for the given workflow with no options.
    #[must_use]
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            replace: false,
            collections: None,
            task_options: Map::new(),
            chain_filter: None,
        }
    }

    /// Marks the step as a replace dispatch.
    #[must_use]
    pub const fn with_replace(mut self) -> Self {
        self.replace = true;
        self
    }

    /// Sets the chain filter applied when this step is chained into.
    #[must_use]
    pub fn with_chain_filter(mut self, filter: ChainFilter) -> Self {
        self.chain_filter = Some(filter);
        self
    }
}

/// An entry in a payload's process list: a single step, or a fan-out
/// group of parallel branches consumed during chaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    /// One sequential step.
    Single(ProcessStep),
    /// Parallel branches; chaining yields one payload per branch.
    Fanout(Vec<ProcessStep>),
}

/// The work-item document flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Payload identity. Absent until derived; never recomputed once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PayloadId>,
    /// Ordered processing steps; the first entry is the current step.
    pub process: Vec<StepEntry>,
    /// Data records the steps operate on.
    #[serde(default)]
    pub records: Vec<Record>,
}

impl Payload {
    /// Creates a payload from steps and records, without an identity.
    #[must_use]
    pub fn new(process: Vec<StepEntry>, records: Vec<Record>) -> Self {
        Self {
            id: None,
            process,
            records,
        }
    }

    /// Deserializes and validates a payload from a raw JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the document does not deserialize
    /// or fails structural validation.
    pub fn from_json(value: Value) -> Result<Self> {
        let payload: Self =
            serde_json::from_value(value).map_err(|e| Error::InvalidPayload {
                message: format!("payload does not deserialize: {e}"),
            })?;
        payload.validate()?;
        Ok(payload)
    }

    /// Validates the structural invariants of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the payload has no process
    /// steps, a fan-out group in current position, an empty workflow name,
    /// or no ingredients from which an identity could be derived.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.process.first() else {
            return Err(Error::invalid_payload("at least one process step is required"));
        };
        let StepEntry::Single(step) = first else {
            return Err(Error::invalid_payload(
                "the current step must be a single step, not a fan-out group",
            ));
        };
        if step.workflow.is_empty() {
            return Err(Error::invalid_payload("the current step has no workflow name"));
        }
        if self.id.is_none() && self.records.is_empty() {
            return Err(Error::invalid_payload(
                "a payload without an explicit identity requires at least one record",
            ));
        }
        Ok(())
    }

    /// Returns the current (first) process step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the payload has no usable
    /// current step.
    pub fn current_step(&self) -> Result<&ProcessStep> {
        match self.process.first() {
            Some(StepEntry::Single(step)) => Ok(step),
            _ => Err(Error::invalid_payload("payload has no current step")),
        }
    }

    /// Returns the workflow name of the current step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the payload has no current step.
    pub fn workflow(&self) -> Result<&str> {
        Ok(self.current_step()?.workflow.as_str())
    }

    /// Derives the identity this payload would have, without assigning it.
    ///
    /// Collections come from the current step's explicit override when
    /// present, otherwise from the records' collection names.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload lacks the ingredients for derivation.
    pub fn derived_id(&self) -> Result<PayloadId> {
        let step = self.current_step()?;
        let item_ids: Vec<&str> = self.records.iter().map(|r| r.id.as_str()).collect();
        let id = match &step.collections {
            Some(collections) => PayloadId::from_parts(
                collections.iter().map(String::as_str),
                &step.workflow,
                item_ids,
            )?,
            None => PayloadId::from_parts(
                self.records.iter().map(|r| r.collection.as_str()),
                &step.workflow,
                item_ids,
            )?,
        };
        Ok(id)
    }

    /// Ensures the payload carries an identity, deriving it exactly once.
    ///
    /// An identity that is already assigned is never recomputed.
    ///
    /// # Errors
    ///
    /// Returns an error if derivation is required but the ingredients are
    /// missing.
    pub fn ensure_id(&mut self) -> Result<&PayloadId> {
        if self.id.is_none() {
            self.id = Some(self.derived_id()?);
        }
        // The branch above guarantees presence.
        self.id
            .as_ref()
            .ok_or_else(|| Error::invalid_payload("payload identity could not be derived"))
    }

    /// Serializes the payload to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::Serialization {
            message: format!("failed to serialize payload: {e}"),
        })
    }
}
