// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Conversions between Rust domain types and their protobuf wire
//! representations.
//!
//! The wire types generated by `prost` are deliberately kept at the edge of
//! the system; everything else operates on domain types. The [`RustType`]
//! trait is the bridge: a domain type knows how to lower itself into its
//! proto twin and how to (fallibly) reconstruct itself from one.

use std::fmt;

/// An error that can occur when converting a protobuf type into a Rust type.
#[derive(Debug, thiserror::Error)]
pub enum TryFromProtoError {
    /// A required field was missing from the protobuf message.
    #[error("missing field in protobuf object: {0}")]
    MissingField(String),
    /// An enum field carried a value outside the known range.
    #[error("unknown enum variant in protobuf object: {0}")]
    UnknownEnumVariant(String),
    /// A field value was outside the domain type's accepted range.
    #[error("invalid field value in protobuf object: {0}")]
    InvalidFieldValue(String),
}

impl TryFromProtoError {
    /// Construct a `MissingField` error for the named field.
    pub fn missing_field<T: fmt::Display>(field: T) -> Self {
        TryFromProtoError::MissingField(field.to_string())
    }

    /// Construct an `UnknownEnumVariant` error for the named enum.
    pub fn unknown_enum_variant<T: fmt::Display>(enum_name: T) -> Self {
        TryFromProtoError::UnknownEnumVariant(enum_name.to_string())
    }
}

/// A trait for Rust types that have a protobuf twin.
pub trait RustType<Proto>: Sized {
    /// Convert a Rust type into its protobuf representation.
    fn into_proto(&self) -> Proto;

    /// Convert a protobuf representation back into the Rust type.
    fn from_proto(proto: Proto) -> Result<Self, TryFromProtoError>;
}

/// The inverse perspective of [`RustType`], blanket-implemented for every
/// proto type whose Rust twin implements [`RustType`].
pub trait ProtoType<Rust>: Sized {
    /// Convert the protobuf type into its Rust twin.
    fn into_rust(self) -> Result<Rust, TryFromProtoError>;

    /// Build the protobuf type from its Rust twin.
    fn from_rust(rust: &Rust) -> Self;
}

impl<P, R> ProtoType<R> for P
where
    R: RustType<P>,
{
    fn into_rust(self) -> Result<R, TryFromProtoError> {
        R::from_proto(self)
    }

    fn from_rust(rust: &R) -> Self {
        rust.into_proto()
    }
}

impl<P, R> RustType<Vec<P>> for Vec<R>
where
    R: RustType<P>,
{
    fn into_proto(&self) -> Vec<P> {
        self.iter().map(R::into_proto).collect()
    }

    fn from_proto(proto: Vec<P>) -> Result<Self, TryFromProtoError> {
        proto.into_iter().map(R::from_proto).collect()
    }
}

impl<P, R> RustType<Option<P>> for Option<R>
where
    R: RustType<P>,
{
    fn into_proto(&self) -> Option<P> {
        self.as_ref().map(R::into_proto)
    }

    fn from_proto(proto: Option<P>) -> Result<Self, TryFromProtoError> {
        proto.map(R::from_proto).transpose()
    }
}
