//! Model representation.
//!
//! A [`Model`] is an ordered list of parameter [`Tensor`]s. Values are stored in the working
//! precision of the model (`f32`); the aggregator computes in `f64` and only downcasts when it
//! assigns the new global parameters.

use std::{
    iter::{FromIterator, IntoIterator},
    slice::{Iter, IterMut},
};

use derive_more::{From, Index, IndexMut, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("a tensor of shape {shape:?} holds {expected} values, got {actual}")]
/// Errors related to tensor construction.
pub struct ShapeError {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("the models have different tensor layouts")]
/// Errors related to arithmetic between models of different layouts.
pub struct LayoutMismatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A parameter tensor: a shape and its values in row-major order.
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

#[allow(clippy::len_without_is_empty)]
impl Tensor {
    /// Creates a tensor from its shape and row-major values.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, ShapeError> {
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(ShapeError {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Creates a tensor of the given shape filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let values = vec![0.0; shape.iter().product()];
        Self { shape, values }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Gets the number of values of this tensor.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Checks whether all values are finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// A numerical representation of a machine learning model.
pub struct Model(Vec<Tensor>);

#[allow(clippy::len_without_is_empty)]
impl Model {
    /// Gets the number of tensors of this model.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the total number of parameters of this model.
    pub fn num_parameters(&self) -> usize {
        self.0.iter().map(Tensor::len).sum()
    }

    /// Creates an iterator that yields references to the tensors of this model.
    pub fn iter(&self) -> Iter<Tensor> {
        self.0.iter()
    }

    /// Creates an iterator that yields mutable references to the tensors of this model.
    pub fn iter_mut(&mut self) -> IterMut<Tensor> {
        self.0.iter_mut()
    }

    /// Creates a model with the layout of this one, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        self.iter().map(|t| Tensor::zeros(t.shape.clone())).collect()
    }

    /// Checks whether both models have the same number of tensors with pairwise equal shapes.
    pub fn has_same_layout(&self, other: &Model) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a.shape == b.shape)
    }

    /// Checks whether all parameters are finite.
    pub fn is_finite(&self) -> bool {
        self.iter().all(Tensor::is_finite)
    }

    /// Computes `self - other` tensor by tensor.
    ///
    /// With `self` the model a client started from and `other` its locally trained model, this is
    /// the client's update delta (a decrease from the client's perspective).
    ///
    /// # Errors
    /// Fails if the layouts of the models differ.
    pub fn difference(&self, other: &Model) -> Result<Model, LayoutMismatch> {
        if !self.has_same_layout(other) {
            return Err(LayoutMismatch);
        }
        Ok(self
            .iter()
            .zip(other.iter())
            .map(|(a, b)| Tensor {
                shape: a.shape.clone(),
                values: a.values.iter().zip(&b.values).map(|(x, y)| x - y).collect(),
            })
            .collect())
    }
}

impl FromIterator<Tensor> for Model {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        let data: Vec<Tensor> = iter.into_iter().collect();
        Model(data)
    }
}

impl IntoIterator for Model {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
