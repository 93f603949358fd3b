use std::{cmp::Ordering, fmt};

use alloy::primitives::{U256, U512};

/// Length of [`Price::sort_key`].
pub const PRICE_KEY_LEN: usize = 64;

/// The exact rational `charge / value` of a cross-chain transaction.
///
/// A zero `value` has no meaningful ratio and is treated as the highest possible price.
#[derive(Clone, Copy)]
pub enum Price {
    Ratio { charge: U256, value: U256 },
    Max,
}

impl Price {
    pub fn new(charge: U256, value: U256) -> Price {
        if value.is_zero() {
            Price::Max
        } else {
            Price::Ratio { charge, value }
        }
    }

    /// A big-endian key whose byte order matches the order of prices: `(charge << 256) / value`, or all `0xff`
    /// for [`Price::Max`].
    ///
    /// Distinct prices closer than `2^-256` share a key.
    pub fn sort_key(&self) -> [u8; PRICE_KEY_LEN] {
        match self {
            Price::Max => [0xff; PRICE_KEY_LEN],
            Price::Ratio { charge, value } => {
                let key: U512 = (widen(charge) << 256) / widen(value);
                key.to_be_bytes::<PRICE_KEY_LEN>()
            }
        }
    }
}

fn widen(x: &U256) -> U512 {
    U512::from_be_slice(&x.to_be_bytes::<32>())
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Price::Max, Price::Max) => Ordering::Equal,
            (Price::Max, Price::Ratio { .. }) => Ordering::Greater,
            (Price::Ratio { .. }, Price::Max) => Ordering::Less,
            (
                Price::Ratio {
                    charge: c1,
                    value: v1,
                },
                Price::Ratio {
                    charge: c2,
                    value: v2,
                },
            ) => (widen(c1) * widen(v2)).cmp(&(widen(c2) * widen(v1))),
        }
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Price {}

impl fmt::Debug for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Max => write!(f, "max"),
            Price::Ratio { charge, value } => write!(f, "{charge}/{value}"),
        }
    }
}
