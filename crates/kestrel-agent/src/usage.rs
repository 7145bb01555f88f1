//! Token usage accounting.
//!
//! Backend calls made for the conversation itself and for planning are
//! tallied separately so that user-facing totals can exclude planning
//! overhead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::llm::types::Usage;

/// What a backend call was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Conversation,
    /// Intention analysis and plan creation.
    Planning,
}

/// Running per-source usage totals for a session.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    totals: HashMap<UsageSource, Usage>,
    calls: HashMap<UsageSource, u64>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one backend call.  Calls without reported usage still count.
    pub fn record(&mut self, source: UsageSource, usage: Option<Usage>) {
        *self.calls.entry(source).or_default() += 1;
        if let Some(usage) = usage {
            self.totals.entry(source).or_default().add(usage);
        }
    }

    pub fn total_for(&self, source: UsageSource) -> Usage {
        self.totals.get(&source).copied().unwrap_or_default()
    }

    pub fn calls_for(&self, source: UsageSource) -> u64 {
        self.calls.get(&source).copied().unwrap_or_default()
    }

    /// Usage shown to the user: conversation calls only.
    pub fn user_facing_total(&self) -> Usage {
        self.total_for(UsageSource::Conversation)
    }

    /// Everything, planning included.
    pub fn grand_total(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.totals.values() {
            total.add(*usage);
        }
        total
    }

    pub fn reset(&mut self) {
        self.totals.clear();
        self.calls.clear();
    }
}
