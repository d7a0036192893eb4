//! Part layout of a multipart transfer

use crate::config::TransferConfig;
use crate::error::{Result, StratusError};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Lifecycle of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// One contiguous byte range of the object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// Dense, starting at 1
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
    pub etag: Option<String>,
    pub state: PartState,
}

impl PartDescriptor {
    pub fn new(part_number: u32, offset: u64, length: u64) -> Self {
        Self {
            part_number,
            offset,
            length,
            etag: None,
            state: PartState::Pending,
        }
    }

    /// `[offset, offset + length)`
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }

    /// Inclusive bounds as used by an HTTP `Range` header
    pub fn range_header(&self) -> String {
        let end = (self.offset + self.length).saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }

    pub fn is_completed(&self) -> bool {
        self.state == PartState::Completed
    }

    /// Whether a run should (re)transfer this part
    pub fn is_outstanding(&self) -> bool {
        matches!(self.state, PartState::Pending | PartState::Failed)
    }

    pub fn complete(&mut self, etag: String) {
        self.etag = Some(etag);
        self.state = PartState::Completed;
    }

    /// Forget any progress on this part
    pub fn reset(&mut self) {
        self.etag = None;
        self.state = PartState::Pending;
    }
}

/// Part size to use for an object of `object_size` bytes
///
/// A hint below the provider minimum is rejected unless the whole object
/// fits in one (final) part. The result is raised so the object never needs
/// more than `max_parts` parts.
pub fn effective_part_size(
    object_size: u64,
    hint: Option<u64>,
    config: &TransferConfig,
) -> Result<u64> {
    let hint = hint.unwrap_or(config.default_part_size);
    if hint < config.min_part_size && object_size > hint {
        return Err(StratusError::InvalidPartSize {
            part_size: hint,
            minimum: config.min_part_size,
        });
    }

    let floor = object_size.div_ceil(u64::from(config.max_parts.max(1)));
    Ok(hint.max(floor).max(1))
}

/// Split `object_size` bytes into contiguous parts of `part_size`
///
/// The final part carries the remainder. An empty object is one empty part.
pub fn plan_parts(object_size: u64, part_size: u64) -> Vec<PartDescriptor> {
    if object_size == 0 {
        return vec![PartDescriptor::new(1, 0, 0)];
    }
    let part_size = part_size.max(1);
    let count = object_size.div_ceil(part_size);

    (0..count)
        .map(|index| {
            let offset = index * part_size;
            let length = part_size.min(object_size - offset);
            PartDescriptor::new(index as u32 + 1, offset, length)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_covers_object() {
        let parts = plan_parts(16 * MIB, 5 * MIB);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].length, MIB);

        let mut expected_offset = 0;
        for (index, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number, index as u32 + 1);
            assert_eq!(part.offset, expected_offset);
            assert_eq!(part.state, PartState::Pending);
            expected_offset = part.byte_range().end;
        }
        assert_eq!(expected_offset, 16 * MIB);
    }

    #[test]
    fn test_plan_empty_object() {
        let parts = plan_parts(0, 5 * MIB);
        assert_eq!(parts, vec![PartDescriptor::new(1, 0, 0)]);
    }

    #[test]
    fn test_undersized_hint_is_rejected() {
        let config = TransferConfig::default();
        let err = effective_part_size(16 * MIB, Some(MIB), &config).unwrap_err();
        assert!(matches!(
            err,
            StratusError::InvalidPartSize { part_size, minimum } if part_size == MIB && minimum == 5 * MIB
        ));
    }

    #[test]
    fn test_small_object_may_use_small_part() {
        let config = TransferConfig::default();
        assert_eq!(effective_part_size(MIB, Some(2 * MIB), &config).unwrap(), 2 * MIB);
    }

    #[test]
    fn test_part_size_raised_to_fit_part_limit() {
        let config = TransferConfig {
            max_parts: 4,
            ..TransferConfig::default()
        };
        assert_eq!(
            effective_part_size(40 * MIB, Some(5 * MIB), &config).unwrap(),
            10 * MIB
        );
    }

    #[test]
    fn test_range_header() {
        let part = PartDescriptor::new(2, 100, 50);
        assert_eq!(part.range_header(), "bytes=100-149");
        assert_eq!(part.byte_range(), 100..150);
    }
}
