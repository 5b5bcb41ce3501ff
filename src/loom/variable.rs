use std::sync::{Arc, RwLock};

use derive_more::{Deref, DerefMut, Display};

use super::{
    layout::{IntoLayout, Layout},
    tensor::{Tensor, TensorError},
};
use crate::init::Init;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct VariableId(uid::Id<VariableId>);

#[derive(Debug)]
struct VariableInner {
    id: VariableId,
    name: String,
    trainable: bool,
    init: Option<Init>,
    value: RwLock<Tensor>,
}

/// Named, mutable state shared between layers and optimizers.
///
/// Clones refer to the same variable. The held tensor is replaced as a whole,
/// so a value read before an update keeps its old data.
#[derive(Debug, Clone)]
pub struct Variable(Arc<VariableInner>);

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Variable {
    fn build(name: &str, value: Tensor, trainable: bool, init: Option<Init>) -> Self {
        let inner = VariableInner {
            id: VariableId::default(),
            name: name.to_owned(),
            trainable,
            init,
            value: RwLock::new(value.detach()),
        };
        Self(Arc::new(inner))
    }

    /// A trainable variable holding `value`.
    #[inline]
    pub fn new(name: &str, value: Tensor) -> Self {
        Self::build(name, value, true, None)
    }

    /// A variable that never receives gradients.
    #[inline]
    pub fn constant(name: &str, value: Tensor) -> Self {
        Self::build(name, value, false, None)
    }

    /// A variable initialized by `init`, which is kept so that [`Variable::reinit`] can re-run it.
    pub fn with_init(
        name: &str,
        layout: impl IntoLayout,
        init: Init,
        trainable: bool,
    ) -> Result<Self, TensorError> {
        let value = init.tensor(layout.into_layout())?;
        Ok(Self::build(name, value, trainable, Some(init)))
    }

    #[inline]
    pub fn id(&self) -> VariableId {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of live handles to this variable.
    #[inline]
    pub(crate) fn handles(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn trainable(&self) -> bool {
        self.0.trainable
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.0.value.read().expect("failed to lock").layout()
    }

    /// The current value. Gradients flow back to the variable if it is trainable.
    #[inline]
    pub fn value(&self) -> Tensor {
        let value = self.0.value.read().expect("failed to lock").clone();
        match self.0.trainable {
            true => value.tracked(self.0.id),
            false => value,
        }
    }

    /// Replaces the value. The layout must not change.
    pub fn assign(&self, value: Tensor) -> Result<(), TensorError> {
        let mut lock = self.0.value.write().expect("failed to lock");
        let value = value.detach().check_layout(lock.layout())?;
        *lock = value;
        Ok(())
    }

    /// Subtracts `delta` from the value.
    pub fn assign_sub(&self, delta: &Tensor) -> Result<(), TensorError> {
        let mut lock = self.0.value.write().expect("failed to lock");
        let value = lock.try_sub(&delta.detach())?.check_layout(lock.layout())?;
        *lock = value;
        Ok(())
    }

    /// Re-runs the initializer, if any. Returns `true` if the value changed.
    pub fn reinit(&self) -> Result<bool, TensorError> {
        let Some(init) = &self.0.init else {
            return Ok(false);
        };
        let mut lock = self.0.value.write().expect("failed to lock");
        *lock = init.tensor(lock.layout())?;
        log::debug!("initialized variable {}", self.0.name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Variable;
    use crate::{init::Init, loom::tensor::Tensor};

    #[test]
    fn test_variable_assign() -> Result<(), Box<dyn Error>> {
        let var = Variable::new("w", Tensor::ones([2, 2]));
        let before = var.value();
        var.assign_sub(&Tensor::full([2, 2], 0.5))?;
        assert_eq!(before.data(), &[1.0; 4]);
        assert_eq!(var.value().data(), &[0.5; 4]);
        assert!(var.assign(Tensor::ones([4])).is_err());

        let shared = var.clone();
        shared.assign(Tensor::zeros([2, 2]))?;
        assert_eq!(var.value().data(), &[0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_variable_reinit() -> Result<(), Box<dyn Error>> {
        let var = Variable::with_init("w", [3], Init::Constant(2.0), true)?;
        var.assign(Tensor::zeros([3]))?;
        assert!(var.reinit()?);
        assert_eq!(var.value().data(), &[2.0; 3]);
        assert!(var.value().requires_grad());

        let constant = Variable::constant("c", Tensor::ones([1]));
        assert!(!constant.reinit()?);
        assert!(!constant.value().requires_grad());
        Ok(())
    }
}
