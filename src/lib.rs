#![doc = include_str!("../README.md")]

/// The bread-and-butter, shrink-wrapped and ready to use
pub mod prelude {
    pub use crate::Error;
    pub use crate::ellipsoid::Ellipsoid;
    pub use crate::model::Component;
    pub use crate::model::Model;
    pub use crate::model::ModelOptions;
    pub use crate::model::ScaledComponent;
    pub use crate::time::Time;
}

/// Extended prelude for the modules making up the evaluator
pub mod internals {
    pub use crate::cache::Cache;
    pub use crate::cache::CachedArray;
    pub use crate::deformation::deformation_columns;
    pub use crate::deformation::DeformationList;
    pub use crate::grid::Grid;
    pub use crate::prelude::*;
    pub use crate::spatial::ModelStore;
    pub use crate::spatial::SpatialModel;
    pub use crate::spatial::SpatialModelSet;
    pub use crate::table::Field;
    pub use crate::table::Record;
    pub use crate::table::TableReader;
    pub use crate::table::TableSpec;
    pub use crate::table::Value;
    pub use crate::temporal::TimeFunction;
    pub use crate::temporal::TimeModel;
    pub use crate::tin::Tin;

    // External material
    pub use log::debug;
    pub use log::info;
    pub use log::trace;
    pub use log::warn;
    pub use std::collections::BTreeMap;
}

use thiserror::Error;
/// The deformation model error taxonomy. `OutOfRange` and `Undefined` are
/// evaluation-time conditions that an enclosing spatial model set may absorb;
/// the other variants are fatal to the model load.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    /// Structural or invariant violation in the model definition
    #[error("Model definition error: {0}")]
    Definition(String),

    /// A value that cannot be parsed into its declared type
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A query point or date outside the valid range of a submodel
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// A deformation that is undefined (holes in the model)
    #[error("Undefined value: {0}")]
    Undefined(String),
}

impl Error {
    /// Attach file name and record number context to a load-time error
    pub(crate) fn in_record(self, recno: usize, filename: &std::path::Path) -> Error {
        let context = format!(" in record {} of file {}", recno, filename.display());
        match self {
            Error::Definition(msg) => Error::Definition(msg + &context),
            Error::InvalidValue(msg) => Error::InvalidValue(msg + &context),
            Error::OutOfRange(msg) => Error::OutOfRange(msg + &context),
            Error::Undefined(msg) => Error::Undefined(msg + &context),
            other => other,
        }
    }
}

pub mod cache;
pub mod deformation;
pub mod ellipsoid;
pub mod grid;
pub mod model;
pub mod spatial;
pub mod table;
pub mod temporal;
pub mod time;
pub mod tin;
