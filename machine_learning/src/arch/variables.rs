use super::embedding::EmbeddingVariable;

/// A dense parameter tensor, stored row major.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseVariable {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl DenseVariable {
    /// Creates a new `DenseVariable`.
    ///
    /// # Arguments
    /// * `name` - A name unique within the model.
    /// * `shape` - The dimensions of the tensor.
    /// * `values` - Its row major values, as many as the product of `shape`.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());

        Self {
            name: name.into(),
            shape,
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }
}

/// A trainable variable, tagged with its kind when the model creates it.
#[derive(Debug)]
pub enum Trainable<'a> {
    Embedding(&'a mut EmbeddingVariable),
    Dense(&'a mut DenseVariable),
}

/// The trainable variables split by the optimizer that updates them.
#[derive(Debug, Default)]
pub struct VariablePartition<'a> {
    pub embedding: Vec<&'a mut EmbeddingVariable>,
    pub dense: Vec<&'a mut DenseVariable>,
}

impl VariablePartition<'_> {
    /// The amount of variables in both sets.
    pub fn len(&self) -> usize {
        self.embedding.len() + self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `variables` into embedding and dense variables, keeping their relative order.
///
/// Every variable lands in exactly one of the sets.
pub fn partition<'a, I>(variables: I) -> VariablePartition<'a>
where
    I: IntoIterator<Item = Trainable<'a>>,
{
    let mut partition = VariablePartition::default();

    for variable in variables {
        match variable {
            Trainable::Embedding(v) => partition.embedding.push(v),
            Trainable::Dense(v) => partition.dense.push(v),
        }
    }

    partition
}
