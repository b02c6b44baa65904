//! Tool-call accumulator
//!
//! Providers stream a tool call as fragments tagged with the call's index.
//! Fragments are concatenated per index in arrival order and read back only
//! after the provider signals the end of the turn.

use crate::message::ToolCall;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Mutex<BTreeMap<usize, PendingToolCall>>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment into the call at `index`.
    ///
    /// `id` is kept from the first fragment that carries one. A name
    /// fragment that differs from the name seen so far continues it; an
    /// identical repeat is ignored.
    pub fn add_chunk(&self, index: usize, id: Option<&str>, name: Option<&str>, arguments: &str) {
        let mut calls = self.calls.lock();
        let call = calls.entry(index).or_default();

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if call.id.is_empty() {
                call.id = id.to_string();
            }
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if call.name.is_empty() {
                call.name = name.to_string();
            } else if call.name != name {
                call.name.push_str(name);
            }
        }
        call.arguments.push_str(arguments);
    }

    /// Calls sorted by index; calls without an id get `call_{index}`
    pub fn get_calls(&self) -> Vec<ToolCall> {
        let calls = self.calls.lock();
        calls
            .iter()
            .filter_map(|(index, call)| {
                if call.name.is_empty() {
                    debug!(index, "Dropping tool call fragment without a name");
                    return None;
                }
                let id = if call.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    call.id.clone()
                };
                Some(ToolCall {
                    index: *index,
                    id,
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}
