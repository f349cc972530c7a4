//! Shipping flags of a snapshot definition.
//!
//! The flags are independent bits, but only some combinations describe a
//! real phase of a shipment. Every transition goes through [`ShippingFlags::apply`],
//! which rejects the result if it is not one of them.

use crate::error::{CtrlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShippingFlag {
    Shipping,
    ShippingAbort,
    ShippingCleanup,
    Shipped,
    /// Backup shipping as opposed to a plain snapshot resync.
    Backup,
}

impl ShippingFlag {
    pub const ALL: [ShippingFlag; 5] = [
        ShippingFlag::Shipping,
        ShippingFlag::ShippingAbort,
        ShippingFlag::ShippingCleanup,
        ShippingFlag::Shipped,
        ShippingFlag::Backup,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            ShippingFlag::Shipping => "SHIPPING",
            ShippingFlag::ShippingAbort => "SHIPPING_ABORT",
            ShippingFlag::ShippingCleanup => "SHIPPING_CLEANUP",
            ShippingFlag::Shipped => "SHIPPED",
            ShippingFlag::Backup => "BACKUP",
        }
    }
}

/// Where a shipment stands, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShippingPhase {
    Queued,
    InFlight,
    Completed,
    CleaningUp,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShippingFlags(u8);

impl ShippingFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Build a flag set, rejecting illegal combinations.
    pub fn of(flags: &[ShippingFlag]) -> Result<Self> {
        let mut out = Self::empty();
        out.apply(&[], flags)?;
        Ok(out)
    }

    pub fn is_set(&self, flag: ShippingFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_set_all(&self, flags: &[ShippingFlag]) -> bool {
        flags.iter().all(|f| self.is_set(*f))
    }

    pub fn is_unset(&self, flag: ShippingFlag) -> bool {
        !self.is_set(flag)
    }

    pub fn enable(&mut self, flags: &[ShippingFlag]) -> Result<()> {
        self.apply(&[], flags)
    }

    pub fn disable(&mut self, flags: &[ShippingFlag]) -> Result<()> {
        self.apply(flags, &[])
    }

    /// Clear `disable`, then set `enable`, as one transition. The flags are
    /// left untouched if the result is illegal.
    pub fn apply(&mut self, disable: &[ShippingFlag], enable: &[ShippingFlag]) -> Result<()> {
        let mut next = self.0;
        for flag in disable {
            next &= !flag.bit();
        }
        for flag in enable {
            next |= flag.bit();
        }
        let candidate = Self(next);
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Flags are reset when the owning snapshot definition goes away.
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn validate(&self) -> Result<()> {
        use ShippingFlag::*;
        let illegal = [
            (Shipping, Shipped),
            (Shipping, ShippingAbort),
            (Shipped, ShippingAbort),
        ];
        for (a, b) in illegal {
            if self.is_set(a) && self.is_set(b) {
                return Err(CtrlError::IllegalFlags(self.to_string()));
            }
        }
        if self.is_set(ShippingCleanup) && self.is_unset(ShippingAbort) {
            return Err(CtrlError::IllegalFlags(self.to_string()));
        }
        Ok(())
    }

    pub fn phase(&self) -> ShippingPhase {
        use ShippingFlag::*;
        if self.is_set(Shipping) {
            ShippingPhase::InFlight
        } else if self.is_set(Shipped) {
            ShippingPhase::Completed
        } else if self.is_set(ShippingCleanup) {
            ShippingPhase::CleaningUp
        } else if self.is_set(ShippingAbort) {
            ShippingPhase::Aborted
        } else {
            ShippingPhase::Queued
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ShippingFlag> + '_ {
        ShippingFlag::ALL.into_iter().filter(|f| self.is_set(*f))
    }
}

impl fmt::Display for ShippingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ShippingFlag::name).collect();
        if names.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}]", names.join(" | "))
        }
    }
}
