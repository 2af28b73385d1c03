//! 16-digit numeric credentials for sources without an account.

use crate::{CryptoError, CryptoSrc};

use zeroize::{Zeroize, ZeroizeOnDrop};

use std::{fmt, str::FromStr};

/// Number of decimal digits in a keycode.
pub const KEYCODE_DIGITS: usize = 16;
const GROUP: usize = 4;

/// A keycode: exactly 16 decimal digits.
///
/// `Display` renders the grouped form shown to people (`1234 5678 9012 3456`); [`as_str`] is the
/// bare form fed to key derivation. The digits are wiped on drop.
///
/// [`as_str`]: Keycode::as_str
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Keycode(String);

impl Keycode {
    /// Generate a keycode with every digit drawn uniformly.
    pub fn generate<R: CryptoSrc + ?Sized>(csprng: &mut R) -> Self {
        let mut digits = String::with_capacity(KEYCODE_DIGITS);
        let mut buf = [0u8; 32];
        while digits.len() < KEYCODE_DIGITS {
            csprng.fill_bytes(&mut buf);
            // 250 is the largest multiple of 10 that fits in a byte.
            for b in buf.iter().filter(|b| **b < 250) {
                if digits.len() == KEYCODE_DIGITS {
                    break;
                }
                digits.push(char::from(b'0' + (b % 10)));
            }
        }
        buf.zeroize();
        Self(digits)
    }

    /// Parse the grouped display form. Spaces are ignored wherever they appear; anything else
    /// must be a digit.
    pub fn from_grouped(s: &str) -> Result<Self, CryptoError> {
        let mut bare: String = s.chars().filter(|c| *c != ' ').collect();
        let parsed = bare.parse();
        bare.zeroize();
        parsed
    }

    /// The 16 digits with no separators.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Keycode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEYCODE_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CryptoError::BadFormat("Keycode must be exactly 16 decimal digits"));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Keycode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, chunk) in self.0.as_bytes().chunks(GROUP).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            for b in chunk {
                write!(f, "{}", char::from(*b))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Keycode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Keycode(****)")
    }
}
