//! Allocation traces.
//!
//! A trace names live blocks by slot index so it can be replayed against any
//! heap regardless of the addresses it hands out.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::HarnessError;

pub const TRACE_VERSION: u32 = 1;

/// One traced call. Allocating into an occupied slot frees the old block first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    Malloc { slot: usize, size: usize },
    Calloc { slot: usize, count: usize, size: usize },
    Realloc { slot: usize, size: usize },
    Free { slot: usize },
}

impl TraceOp {
    #[must_use]
    pub fn slot(&self) -> usize {
        match *self {
            Self::Malloc { slot, .. }
            | Self::Calloc { slot, .. }
            | Self::Realloc { slot, .. }
            | Self::Free { slot } => slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub version: u32,
    /// Number of slots ops may refer to.
    pub slots: usize,
    pub ops: Vec<TraceOp>,
}

impl Trace {
    #[must_use]
    pub fn new(slots: usize, ops: Vec<TraceOp>) -> Self {
        Self {
            version: TRACE_VERSION,
            slots,
            ops,
        }
    }

    /// Parses a trace and checks its version and slot references.
    pub fn from_json(text: &str) -> Result<Self, HarnessError> {
        let trace: Self = serde_json::from_str(text)?;
        trace.validate()?;
        Ok(trace)
    }

    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_file(&self, path: &Path) -> Result<(), HarnessError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.version != TRACE_VERSION {
            return Err(HarnessError::Version(self.version));
        }
        match self
            .ops
            .iter()
            .enumerate()
            .find(|(_, op)| op.slot() >= self.slots)
        {
            Some((index, op)) => Err(HarnessError::SlotOutOfRange {
                index,
                slot: op.slot(),
                slots: self.slots,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_are_tagged_by_name() {
        let trace = Trace::from_json(
            r#"{"version":1,"slots":2,"ops":[
                {"op":"malloc","slot":0,"size":24},
                {"op":"calloc","slot":1,"count":4,"size":8},
                {"op":"realloc","slot":0,"size":100},
                {"op":"free","slot":1}
            ]}"#,
        )
        .unwrap();
        assert_eq!(trace.ops[0], TraceOp::Malloc { slot: 0, size: 24 });
        assert_eq!(trace.ops[3], TraceOp::Free { slot: 1 });
        let again = Trace::from_json(&trace.to_json().unwrap()).unwrap();
        assert_eq!(again, trace);
    }

    #[test]
    fn rejects_bad_slot_and_version() {
        let err = Trace::from_json(r#"{"version":1,"slots":1,"ops":[{"op":"free","slot":3}]}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::SlotOutOfRange { index: 0, slot: 3, slots: 1 }
        ));
        let err = Trace::from_json(r#"{"version":9,"slots":1,"ops":[]}"#).unwrap_err();
        assert!(matches!(err, HarnessError::Version(9)));
    }
}
