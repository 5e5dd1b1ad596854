//! UID/GID shifting for user-namespace isolated pods.
//!
//! An image embeds numeric ownership (usually rooted at 0). Each pod gets a
//! contiguous block of host ids; entries are remapped into that block when the
//! image tree is replicated for the pod.

use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PodfsError;

/// Errors returned when an id cannot be mapped.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum ShiftError {
    /// The uid is outside the range.
    #[error("uid {uid} is outside the range of {count} ids")]
    #[diagnostic(code(podfs::uid::uid_out_of_range))]
    UidOutOfRange {
        /// The rejected uid.
        uid: u32,
        /// Size of the range.
        count: u32,
    },

    /// The gid is outside the range.
    #[error("gid {gid} is outside the range of {count} ids")]
    #[diagnostic(code(podfs::uid::gid_out_of_range))]
    GidOutOfRange {
        /// The rejected gid.
        gid: u32,
        /// Size of the range.
        count: u32,
    },

    /// Shifting would not fit in 32 bits.
    #[error("id {id} shifted by {shift} overflows")]
    #[diagnostic(code(podfs::uid::overflow))]
    Overflow {
        /// The id being shifted.
        id: u32,
        /// The shift applied.
        shift: u32,
    },
}

/// Maps image ownership to host ownership.
pub trait ShiftRange {
    /// Returns the host `(uid, gid)` for an image `(uid, gid)`.
    ///
    /// # Errors
    ///
    /// Returns an error if either id has no mapping. Implementations must be
    /// deterministic and must fail rather than wrap.
    fn shift_range(&self, uid: u32, gid: u32) -> Result<(u32, u32), ShiftError>;
}

impl<F> ShiftRange for F
where
    F: Fn(u32, u32) -> Result<(u32, u32), ShiftError>,
{
    fn shift_range(&self, uid: u32, gid: u32) -> Result<(u32, u32), ShiftError> {
        self(uid, gid)
    }
}

/// A block of `count` host ids starting at `shift`.
///
/// A zero shift disables shifting: every id maps to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UidRange {
    /// First host id of the range.
    pub shift: u32,
    /// Number of ids in the range.
    pub count: u32,
}

impl UidRange {
    /// Create a new range.
    #[must_use]
    pub const fn new(shift: u32, count: u32) -> Self {
        Self { shift, count }
    }

    /// The identity mapping (shifting disabled).
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0, 0)
    }

    /// Whether this range remaps ids.
    #[must_use]
    pub const fn is_shifted(&self) -> bool {
        self.shift != 0
    }

    fn check(&self, uid: u32, gid: u32) -> Result<(), ShiftError> {
        if uid >= self.count {
            return Err(ShiftError::UidOutOfRange {
                uid,
                count: self.count,
            });
        }
        if gid >= self.count {
            return Err(ShiftError::GidOutOfRange {
                gid,
                count: self.count,
            });
        }
        Ok(())
    }

    fn add(&self, id: u32) -> Result<u32, ShiftError> {
        id.checked_add(self.shift).ok_or(ShiftError::Overflow {
            id,
            shift: self.shift,
        })
    }

    /// Maps host ids back to image ids.
    ///
    /// # Errors
    ///
    /// Returns an error if either id lies outside `[shift, shift + count)`.
    pub fn unshift_range(&self, uid: u32, gid: u32) -> Result<(u32, u32), ShiftError> {
        if !self.is_shifted() {
            return Ok((uid, gid));
        }
        let image_uid = uid
            .checked_sub(self.shift)
            .ok_or(ShiftError::UidOutOfRange {
                uid,
                count: self.count,
            })?;
        let image_gid = gid
            .checked_sub(self.shift)
            .ok_or(ShiftError::GidOutOfRange {
                gid,
                count: self.count,
            })?;
        self.check(image_uid, image_gid)?;
        Ok((image_uid, image_gid))
    }
}

impl ShiftRange for UidRange {
    fn shift_range(&self, uid: u32, gid: u32) -> Result<(u32, u32), ShiftError> {
        if !self.is_shifted() {
            return Ok((uid, gid));
        }
        self.check(uid, gid)?;
        Ok((self.add(uid)?, self.add(gid)?))
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shift, self.count)
    }
}

impl FromStr for UidRange {
    type Err = PodfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PodfsError::InvalidUidRange {
            value: s.to_string(),
        };
        let (shift, count) = s.split_once(':').ok_or_else(invalid)?;
        let shift = shift.trim().parse().map_err(|_| invalid())?;
        let count = count.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(shift, count))
    }
}

impl TryFrom<String> for UidRange {
    type Error = PodfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UidRange> for String {
    fn from(range: UidRange) -> Self {
        range.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_maps_everything() {
        let range = UidRange::identity();
        assert!(!range.is_shifted());
        assert_eq!(range.shift_range(0, 0), Ok((0, 0)));
        assert_eq!(range.shift_range(u32::MAX, 42), Ok((u32::MAX, 42)));
    }

    #[test]
    fn shifts_into_pod_range() {
        let range = UidRange::new(100_000, 65_536);
        assert_eq!(range.shift_range(0, 0), Ok((100_000, 100_000)));
        assert_eq!(range.shift_range(1000, 100), Ok((101_000, 100_100)));
    }

    #[test]
    fn rejects_ids_outside_range() {
        let range = UidRange::new(100_000, 65_536);
        assert_eq!(
            range.shift_range(65_536, 0),
            Err(ShiftError::UidOutOfRange {
                uid: 65_536,
                count: 65_536
            })
        );
        assert_eq!(
            range.shift_range(0, 70_000),
            Err(ShiftError::GidOutOfRange {
                gid: 70_000,
                count: 65_536
            })
        );
    }

    #[test]
    fn refuses_to_wrap() {
        let range = UidRange::new(u32::MAX - 10, u32::MAX);
        assert_eq!(
            range.shift_range(20, 0),
            Err(ShiftError::Overflow {
                id: 20,
                shift: u32::MAX - 10
            })
        );
    }

    #[test]
    fn unshift_rejects_ids_below_shift() {
        let range = UidRange::new(100_000, 65_536);
        assert!(range.unshift_range(99_999, 100_000).is_err());
        assert_eq!(range.unshift_range(100_001, 100_002), Ok((1, 2)));
    }

    #[test]
    fn parse_and_display() {
        let range: UidRange = "100000:65536".parse().unwrap();
        assert_eq!(range, UidRange::new(100_000, 65_536));
        assert_eq!(range.to_string(), "100000:65536");

        assert!("100000".parse::<UidRange>().is_err());
        assert!("a:b".parse::<UidRange>().is_err());
        assert!(":65536".parse::<UidRange>().is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let json = serde_json::to_string(&UidRange::new(65_536, 1024)).unwrap();
        assert_eq!(json, "\"65536:1024\"");
        let back: UidRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UidRange::new(65_536, 1024));
        assert!(serde_json::from_str::<UidRange>("\"nope\"").is_err());
    }

    #[test]
    fn closures_are_ranges() {
        let fixed = |_uid: u32, _gid: u32| -> Result<(u32, u32), ShiftError> { Ok((7, 8)) };
        assert_eq!(fixed.shift_range(0, 0), Ok((7, 8)));
    }

    proptest! {
        #[test]
        fn shift_is_deterministic_and_invertible(
            shift in 1u32..=u32::MAX / 2,
            count in 1u32..=65_536,
            uid in 0u32..65_536,
            gid in 0u32..65_536,
        ) {
            let range = UidRange::new(shift, count);
            let first = range.shift_range(uid, gid);
            prop_assert_eq!(first.clone(), range.shift_range(uid, gid));

            match first {
                Ok((host_uid, host_gid)) => {
                    prop_assert!(uid < count && gid < count);
                    prop_assert!(host_uid >= shift && host_gid >= shift);
                    prop_assert_eq!(range.unshift_range(host_uid, host_gid), Ok((uid, gid)));
                }
                Err(_) => prop_assert!(uid >= count || gid >= count),
            }
        }

        #[test]
        fn never_wraps(shift in 1u32..=u32::MAX, uid in any::<u32>(), gid in any::<u32>()) {
            let range = UidRange::new(shift, u32::MAX);
            if let Ok((host_uid, host_gid)) = range.shift_range(uid, gid) {
                prop_assert_eq!(u64::from(host_uid), u64::from(uid) + u64::from(shift));
                prop_assert_eq!(u64::from(host_gid), u64::from(gid) + u64::from(shift));
            }
        }
    }
}
