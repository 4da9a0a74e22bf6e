//! Key and value serializers
//!
//! A producer is built with two independent serializers, one for keys and one
//! for values. Returning `Ok(None)` produces a null field (a tombstone when
//! used for the value).

use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts an application value into bytes
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, topic: &str, value: &T) -> Result<Option<Bytes>>;
}

/// Passes raw bytes through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteSerializer;

impl<T: AsRef<[u8]>> Serializer<T> for ByteSerializer {
    fn serialize(&self, _topic: &str, value: &T) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::copy_from_slice(value.as_ref())))
    }
}

/// UTF-8 encodes strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl<T: AsRef<str>> Serializer<T> for StringSerializer {
    fn serialize(&self, _topic: &str, value: &T) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::copy_from_slice(value.as_ref().as_bytes())))
    }
}

/// Encodes any `serde::Serialize` value as JSON
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn(&T)>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serializer<T> for JsonSerializer<T> {
    fn serialize(&self, _topic: &str, value: &T) -> Result<Option<Bytes>> {
        let encoded = serde_json::to_vec(value)?;
        Ok(Some(Bytes::from(encoded)))
    }
}

/// Serializes `None` as null and delegates `Some` to the inner serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct NullableSerializer<S>(pub S);

impl<T, S: Serializer<T>> Serializer<Option<T>> for NullableSerializer<S> {
    fn serialize(&self, topic: &str, value: &Option<T>) -> Result<Option<Bytes>> {
        match value {
            Some(inner) => self.0.serialize(topic, inner),
            None => Ok(None),
        }
    }
}

/// Adapts a closure into a serializer
pub struct FnSerializer<F>(pub F);

impl<T, F> Serializer<T> for FnSerializer<F>
where
    F: Fn(&T) -> std::result::Result<Vec<u8>, String> + Send + Sync,
{
    fn serialize(&self, _topic: &str, value: &T) -> Result<Option<Bytes>> {
        (self.0)(value)
            .map(|encoded| Some(Bytes::from(encoded)))
            .map_err(Error::Serialization)
    }
}
