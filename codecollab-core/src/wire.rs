//! Lenient decoding of numeric ids arriving on the JSON wire.
//!
//! Browser clients read ids out of URLs and form fields, so `projectId` may
//! show up as `42` or `"42"`. Both decode to the same id. Only wire payloads
//! use this; stored records keep the plain numeric encoding.

use serde::de::{self, Deserializer, Visitor};
use std::fmt;
use std::marker::PhantomData;

/// Deserialize an id from a JSON number or a string of decimal digits.
///
/// Use with `#[serde(deserialize_with = "codecollab_core::wire::numeric_id")]`.
pub fn numeric_id<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<u64>,
{
    deserializer.deserialize_any(NumericIdVisitor(PhantomData))
}

struct NumericIdVisitor<T>(PhantomData<T>);

impl<T: From<u64>> Visitor<'_> for NumericIdVisitor<T> {
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer id or a string of digits")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
        Ok(T::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
        u64::try_from(v)
            .map(T::from)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
        v.parse::<u64>()
            .map(T::from)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}
