//! Variable checkpoints in the safetensors format, keyed by variable name.

use std::path::Path;

use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;
use safetensors::{SafeTensorError, SafeTensors, tensor::TensorView};
use thiserror::Error;

use crate::loom::{
    layout::Layout,
    num::DataType,
    tensor::{Tensor, TensorError},
    variable::Variable,
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint error: no variables to save")]
    Empty,
    #[error("checkpoint error: variable name {0} is not unique")]
    Duplicate(String),
    #[error("checkpoint error: variable {0} not found")]
    Missing(String),
    #[error("checkpoint error: variable {0} has layout {1}, stored {2:?}")]
    Layout(String, Layout, Vec<usize>),
    #[error("checkpoint error: unsupported data type {0:?}")]
    DataType(safetensors::Dtype),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SafeTensor(#[from] SafeTensorError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// # Save (`save`)
/// Writes the values of `variables` to `path`, stored as `r#type`.
///
/// ## Errors
/// Fails if there are no variables or two variables share a name.
pub fn save(
    path: impl AsRef<Path>,
    variables: &[Variable],
    r#type: DataType,
) -> Result<(), CheckpointError> {
    if variables.is_empty() {
        return Err(CheckpointError::Empty);
    }
    let mut names = HashSet::default();
    if let Some(variable) = variables.iter().find(|v| !names.insert(v.name())) {
        return Err(CheckpointError::Duplicate(variable.name().to_owned()));
    }

    let encoded = variables
        .iter()
        .map(|variable| {
            let value = variable.value();
            (variable.name(), value.shape().to_vec(), r#type.encode(value.data()))
        })
        .collect_vec();
    let views = encoded
        .iter()
        .map(|(name, shape, bytes)| Ok((*name, TensorView::new(r#type.into(), shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>, CheckpointError>>()?;
    safetensors::serialize_to_file(views, &None, path.as_ref())?;

    log::debug!(
        "saved {} variables as {} to {}",
        variables.len(),
        r#type,
        path.as_ref().display()
    );
    Ok(())
}

/// # Load (`load`)
/// Assigns the values stored at `path` to `variables`, matched by name.
///
/// ## Errors
/// Fails if a variable is missing from the checkpoint or its stored layout differs.
/// No variable is changed in that case.
pub fn load(path: impl AsRef<Path>, variables: &[Variable]) -> Result<(), CheckpointError> {
    let bytes = std::fs::read(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let values = variables
        .iter()
        .map(|variable| {
            let name = variable.name();
            let view = tensors
                .tensor(name)
                .map_err(|_| CheckpointError::Missing(name.to_owned()))?;
            let layout = variable.layout();
            if view.shape() != layout.shape() {
                return Err(CheckpointError::Layout(
                    name.to_owned(),
                    layout,
                    view.shape().to_vec(),
                ));
            }
            let r#type = DataType::try_from(view.dtype()).map_err(CheckpointError::DataType)?;
            Ok(Tensor::create(layout, r#type.decode(view.data()))?)
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (variable, value) in variables.iter().zip_eq(values) {
        variable.assign(value)?;
    }
    log::debug!("loaded {} variables from {}", variables.len(), path.as_ref().display());
    Ok(())
}
