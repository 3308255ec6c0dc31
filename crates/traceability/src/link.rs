use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lonerp_core::{BatchNumber, DocumentRef, ItemId, LedgerError, LedgerResult, Mrn, Quantity};

/// A vertex of the genealogy graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TraceNode {
    Mrn(Mrn),
    Batch(BatchNumber),
    Document(DocumentRef),
}

impl core::fmt::Display for TraceNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TraceNode::Mrn(mrn) => write!(f, "MRN {mrn}"),
            TraceNode::Batch(batch) => write!(f, "batch {batch}"),
            TraceNode::Document(doc) => write!(f, "document {doc}"),
        }
    }
}

impl From<Mrn> for TraceNode {
    fn from(value: Mrn) -> Self {
        TraceNode::Mrn(value)
    }
}

impl From<BatchNumber> for TraceNode {
    fn from(value: BatchNumber) -> Self {
        TraceNode::Batch(value)
    }
}

impl From<DocumentRef> for TraceNode {
    fn from(value: DocumentRef) -> Self {
        TraceNode::Document(value)
    }
}

/// One side of a link: the document it came from plus any batch/MRN it carried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEndpoint {
    pub document: Option<DocumentRef>,
    pub batch: Option<BatchNumber>,
    pub mrn: Option<Mrn>,
}

impl TraceEndpoint {
    pub fn batch(batch: BatchNumber) -> Self {
        Self {
            batch: Some(batch),
            ..Self::default()
        }
    }

    pub fn mrn(mrn: Mrn) -> Self {
        Self {
            mrn: Some(mrn),
            ..Self::default()
        }
    }

    pub fn document(document: DocumentRef) -> Self {
        Self {
            document: Some(document),
            ..Self::default()
        }
    }

    pub fn with_document(mut self, document: DocumentRef) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_mrn(mut self, mrn: Mrn) -> Self {
        self.mrn = Some(mrn);
        self
    }

    /// Node this endpoint resolves to: batch, else MRN, else document.
    pub fn node(&self) -> LedgerResult<TraceNode> {
        if let Some(batch) = &self.batch {
            return Ok(TraceNode::Batch(batch.clone()));
        }
        if let Some(mrn) = &self.mrn {
            return Ok(TraceNode::Mrn(mrn.clone()));
        }
        self.document
            .clone()
            .map(TraceNode::Document)
            .ok_or_else(|| LedgerError::validation("trace endpoint needs a batch, MRN or document"))
    }
}

/// Immutable directed edge `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLink {
    pub source: TraceEndpoint,
    pub target: TraceEndpoint,
    pub item_id: ItemId,
    pub quantity: Quantity,
    pub link_date: DateTime<Utc>,
}

impl TraceLink {
    pub fn new(
        source: TraceEndpoint,
        target: TraceEndpoint,
        item_id: ItemId,
        quantity: Quantity,
        link_date: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            target,
            item_id,
            quantity,
            link_date,
        }
    }
}
