//! ACTION_SEC fragmentation.
//!
//! An ACTION message with more actions than fit in one datagram is sent as a
//! numbered run of ACTION_SEC messages. Every section header carries the total
//! (`Subtask`) and its own 0-based position (`Index`).

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::{Header, Message, MsgType, Origin};

/// Split an ACTION message into sections of at most `section_size` actions.
///
/// Messages of any other type, or ACTION messages already within the limit,
/// come back unchanged as a single element.
pub fn split_into_sections(message: &Message, section_size: usize) -> Vec<Message> {
    if message.msg_type() != MsgType::Action
        || section_size == 0
        || message.payload.len() <= section_size
    {
        return vec![message.clone()];
    }

    let chunks: Vec<&[Value]> = message.payload.chunks(section_size).collect();
    let total = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Message {
            header: Header {
                origin: message.header.origin,
                msg_type: MsgType::ActionSec,
                subtask: Some(total),
                index: Some(i as u32),
            },
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Receiver-side reassembly of ACTION_SEC runs.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    total: Option<u32>,
    parts: BTreeMap<u32, Vec<Value>>,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one ACTION_SEC message. Returns the rebuilt ACTION message once
    /// every section of the run has arrived.
    pub fn push(&mut self, section: Message) -> Option<Message> {
        if section.msg_type() != MsgType::ActionSec {
            return None;
        }
        let (total, index) = match (section.header.subtask, section.header.index) {
            (Some(t), Some(i)) if i < t => (t, i),
            _ => {
                debug!("MAVC: ACTION_SEC without a usable Subtask/Index, dropped");
                return None;
            }
        };

        if self.total != Some(total) {
            // A different run started; whatever we held is stale.
            self.parts.clear();
            self.total = Some(total);
        }
        self.parts.insert(index, section.payload);

        if self.parts.len() as u32 == total {
            let payload = std::mem::take(&mut self.parts).into_values().flatten().collect();
            self.total = None;
            return Some(Message {
                header: Header::new(Origin::Monitor, MsgType::Action),
                payload,
            });
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.parts.len()
    }
}
