//! NVMe helper types: ANA states, the ANA log page codec and async event
//! classification.

use crate::core::CoreError;
use nix::errno::Errno;
use std::convert::TryInto;

/// Asymmetric namespace access state of one ANA group.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum AnaState {
    Optimized = 0x1,
    NonOptimized = 0x2,
    Inaccessible = 0x3,
    PersistentLoss = 0x4,
    Change = 0xF,
}

impl AnaState {
    pub fn from_u8(v: u8) -> Option<AnaState> {
        match v {
            0x1 => Some(AnaState::Optimized),
            0x2 => Some(AnaState::NonOptimized),
            0x3 => Some(AnaState::Inaccessible),
            0x4 => Some(AnaState::PersistentLoss),
            0xF => Some(AnaState::Change),
            _ => None,
        }
    }

    /// Whether a path in this state may carry I/O.
    pub fn is_usable(&self) -> bool {
        matches!(self, AnaState::Optimized | AnaState::NonOptimized)
    }
}

/// Async events a controller may report.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AsyncEvent {
    /// ANA group states changed; consumers re-read the ANA log page.
    AnaChange,
    /// Namespace attributes changed (size, identifiers) for the given nsid.
    NsAttrChanged(u32),
    /// Reservation log page available.
    ReservationLogAvail,
}

/// One group descriptor of an ANA log page.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AnaGroupDescriptor {
    pub ana_group_id: u32,
    pub ana_state: AnaState,
    pub nsids: Vec<u32>,
}

/// Decoded ANA log page.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AnaLogPage {
    pub change_count: u64,
    pub groups: Vec<AnaGroupDescriptor>,
}

impl AnaLogPage {
    /// Default for groups whose state byte is unknown.
    const HEADER_LEN: usize = 16;
    const DESC_FIXED_LEN: usize = 16;

    /// Serializes the page in its wire layout: a header carrying the change
    /// count and group count, then per group {group id (u32), nsid count
    /// (u32), state (u8), 7 reserved bytes, nsid list (u32 each)}, all
    /// little endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            Self::HEADER_LEN
                + self
                    .groups
                    .iter()
                    .map(|g| Self::DESC_FIXED_LEN + g.nsids.len() * 4)
                    .sum::<usize>(),
        );

        out.extend_from_slice(&self.change_count.to_le_bytes());
        out.extend_from_slice(&(self.groups.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0_u8; 4]);

        for g in &self.groups {
            out.extend_from_slice(&g.ana_group_id.to_le_bytes());
            out.extend_from_slice(&(g.nsids.len() as u32).to_le_bytes());
            out.push(g.ana_state as u8);
            out.extend_from_slice(&[0_u8; 7]);
            for nsid in &g.nsids {
                out.extend_from_slice(&nsid.to_le_bytes());
            }
        }

        out
    }

    /// Parses a page in the layout produced by `encode`.
    pub fn decode(buf: &[u8]) -> Result<AnaLogPage, CoreError> {
        let invalid = || CoreError::NotSupported {
            source: Errno::EINVAL,
        };

        if buf.len() < Self::HEADER_LEN {
            return Err(invalid());
        }

        let change_count = u64::from_le_bytes(buf[0 .. 8].try_into().unwrap());
        let num_groups =
            u32::from_le_bytes(buf[8 .. 12].try_into().unwrap()) as usize;

        let mut at = Self::HEADER_LEN;
        let mut groups = Vec::with_capacity(num_groups);

        for _ in 0 .. num_groups {
            if buf.len() < at + Self::DESC_FIXED_LEN {
                return Err(invalid());
            }

            let ana_group_id =
                u32::from_le_bytes(buf[at .. at + 4].try_into().unwrap());
            let num_nsids =
                u32::from_le_bytes(buf[at + 4 .. at + 8].try_into().unwrap())
                    as usize;
            let ana_state =
                AnaState::from_u8(buf[at + 8]).ok_or_else(invalid)?;

            at += Self::DESC_FIXED_LEN;
            if buf.len() < at + num_nsids * 4 {
                return Err(invalid());
            }

            let mut nsids = Vec::with_capacity(num_nsids);
            for _ in 0 .. num_nsids {
                nsids.push(u32::from_le_bytes(
                    buf[at .. at + 4].try_into().unwrap(),
                ));
                at += 4;
            }

            groups.push(AnaGroupDescriptor {
                ana_group_id,
                ana_state,
                nsids,
            });
        }

        Ok(AnaLogPage {
            change_count,
            groups,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ana_log_page_round_trip() {
        let page = AnaLogPage {
            change_count: 7,
            groups: vec![
                AnaGroupDescriptor {
                    ana_group_id: 1,
                    ana_state: AnaState::Optimized,
                    nsids: vec![1, 2, 3],
                },
                AnaGroupDescriptor {
                    ana_group_id: 2,
                    ana_state: AnaState::Inaccessible,
                    nsids: vec![],
                },
                AnaGroupDescriptor {
                    ana_group_id: 9,
                    ana_state: AnaState::Change,
                    nsids: vec![42],
                },
            ],
        };

        let wire = page.encode();
        let back = AnaLogPage::decode(&wire).unwrap();
        assert_eq!(page, back);
    }

    #[test]
    fn ana_log_page_truncated() {
        let page = AnaLogPage {
            change_count: 0,
            groups: vec![AnaGroupDescriptor {
                ana_group_id: 1,
                ana_state: AnaState::NonOptimized,
                nsids: vec![1],
            }],
        };

        let mut wire = page.encode();
        wire.truncate(wire.len() - 2);
        assert!(AnaLogPage::decode(&wire).is_err());
    }

    #[test]
    fn ana_state_usability() {
        assert!(AnaState::Optimized.is_usable());
        assert!(AnaState::NonOptimized.is_usable());
        assert!(!AnaState::Inaccessible.is_usable());
        assert!(!AnaState::PersistentLoss.is_usable());
        assert!(!AnaState::Change.is_usable());
    }
}
