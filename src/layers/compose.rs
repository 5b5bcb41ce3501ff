use itertools::Itertools;

use super::{
    Layer, LayerError, LayerOp, Value, check_arity, impl_setters, linear::Linear, reuse_graph,
    unique_name,
};
use crate::{
    activation::Activation as ActivationFn,
    graph::{Feed, Graph},
    init::Init,
    loom::{tensor::Tensor, variable::Variable},
};

/// Splits the last axis of `x` into `n_gates` chunks and scales chunk `i` by `gate[.., i]`.
fn apply_gate(x: &Tensor, gate: &Tensor, n_gates: usize) -> Result<Tensor, LayerError> {
    let layout = x.layout();
    let n_units = layout.last();
    let batch = layout.size() / n_units.max(1);
    if n_gates == 0 || n_units % n_gates != 0 {
        return Err(LayerError::Shape(n_gates, layout));
    }
    let x = x.reshape([batch, n_gates, n_units / n_gates])?;
    let gate = gate.reshape([batch, n_gates, 1])?;
    Ok(x.try_mul(&gate)?.reshape(layout)?)
}

/// # Gate (`gate`)
/// Filters a layer with `n_gates` gates computed from a gate input.
///
/// ## Inputs
/// * `layer` - `[batch, n_units]`, dense or sparse, with `n_units` a multiple of `n_gates`.
/// * `gate_input` - `[batch, n_gates]`, passed through the gate function.
#[derive(Debug, Clone)]
pub struct Gate {
    pub gate_fn: ActivationFn,
}

#[derive(Debug, Clone)]
pub struct GateBuilder {
    pub name: Option<String>,
    pub gate_fn: ActivationFn,
}

impl_setters!(GateBuilder { gate_fn: ActivationFn });

impl Gate {
    pub fn builder() -> GateBuilder {
        GateBuilder {
            name: None,
            gate_fn: ActivationFn::Sigmoid,
        }
    }
}

impl GateBuilder {
    pub fn build(self, layer: &Layer, gate_input: &Layer) -> Result<Layer, LayerError> {
        let n_units = layer.n_units();
        let n_gates = gate_input.n_units();
        if n_gates == 0 || n_units % n_gates != 0 {
            return Err(LayerError::Invalid(format!(
                "{n_units} units can not be split into {n_gates} gates"
            )));
        }
        let name = unique_name(self.name.as_deref().unwrap_or("gate"));
        let op = Gate {
            gate_fn: self.gate_fn,
        };
        let shape = layer.shape().clone();
        Ok(Layer::new(name, op, n_units, shape, &[layer.clone(), gate_input.clone()]))
    }
}

impl LayerOp for Gate {
    fn kind(&self) -> &'static str {
        "gate"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x, gate] = check_arity(self.kind(), inputs)?;
        let gate = self.gate_fn.apply(&gate.dense()?)?;
        let n_gates = gate.layout().last();
        Ok(Value::Dense(apply_gate(&x.dense()?, &gate, n_gates)?))
    }
}

/// # Coupled Gate (`coupled_gate`)
/// Mixes two layers with the same gates: `g * layer1 + (1 - g) * layer2`.
#[derive(Debug, Clone)]
pub struct CoupledGate {
    pub gate_fn: ActivationFn,
}

#[derive(Debug, Clone)]
pub struct CoupledGateBuilder {
    pub name: Option<String>,
    pub gate_fn: ActivationFn,
}

impl_setters!(CoupledGateBuilder { gate_fn: ActivationFn });

impl CoupledGate {
    pub fn builder() -> CoupledGateBuilder {
        CoupledGateBuilder {
            name: None,
            gate_fn: ActivationFn::Sigmoid,
        }
    }
}

impl CoupledGateBuilder {
    pub fn build(
        self,
        layer1: &Layer,
        layer2: &Layer,
        gate_input: &Layer,
    ) -> Result<Layer, LayerError> {
        let n_units = layer1.n_units();
        if layer2.n_units() != n_units {
            return Err(LayerError::Invalid(format!(
                "coupled layers have {n_units} and {} units",
                layer2.n_units()
            )));
        }
        let n_gates = gate_input.n_units();
        if n_gates == 0 || n_units % n_gates != 0 {
            return Err(LayerError::Invalid(format!(
                "{n_units} units can not be split into {n_gates} gates"
            )));
        }
        let name = unique_name(self.name.as_deref().unwrap_or("coupled_gate"));
        let op = CoupledGate {
            gate_fn: self.gate_fn,
        };
        let shape = layer1.shape().clone();
        let inputs = [layer1.clone(), layer2.clone(), gate_input.clone()];
        Ok(Layer::new(name, op, n_units, shape, &inputs))
    }
}

impl LayerOp for CoupledGate {
    fn kind(&self) -> &'static str {
        "coupled_gate"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x1, x2, gate] = check_arity(self.kind(), inputs)?;
        let gate = self.gate_fn.apply(&gate.dense()?)?;
        let n_gates = gate.layout().last();
        let y1 = apply_gate(&x1.dense()?, &gate, n_gates)?;
        let y2 = apply_gate(&x2.dense()?, &gate.complement(), n_gates)?;
        Ok(Value::Dense(y1.try_add(&y2)?))
    }
}

#[inline]
fn check_ancestor(kind: &str, x: &Layer, h: &Layer) -> Result<(), LayerError> {
    match h.depends_on(x) {
        true => Ok(()),
        false => Err(LayerError::Invalid(format!(
            "{kind}: {h} does not depend on {x}"
        ))),
    }
}

/// # Highway (`highway`)
/// `t * h + (1 - t) * x` with a learned transform gate `t = sigmoid(x·W + b)`.
///
/// `h` must be computed from `x` and have the same units.
#[derive(Debug, Clone)]
pub struct Highway {
    pub transform: Linear,
}

impl Highway {
    /// Builds a highway whose transform bias starts at `-1`.
    pub fn build(x: &Layer, h: &Layer) -> Result<Layer, LayerError> {
        check_ancestor("highway", x, h)?;
        let n_units = x.n_units();
        if h.n_units() != n_units {
            return Err(LayerError::Invalid(format!(
                "highway: {x} has {n_units} units, {h} has {}",
                h.n_units()
            )));
        }
        let name = unique_name("highway");
        let transform = Linear {
            weights: Variable::with_init(
                &format!("{name}/transform/weights"),
                [n_units, n_units],
                Init::GlorotUniform,
                true,
            )?,
            bias: Some(Variable::with_init(
                &format!("{name}/transform/bias"),
                [n_units],
                Init::Constant(-1.0),
                true,
            )?),
            transpose_weights: false,
            activation: ActivationFn::Sigmoid,
        };
        let shape = h.shape().clone();
        Ok(Layer::new(name, Highway { transform }, n_units, shape, &[x.clone(), h.clone()]))
    }
}

impl LayerOp for Highway {
    fn kind(&self) -> &'static str {
        "highway"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x, h] = check_arity(self.kind(), inputs)?;
        let t = self.transform.compute(&[x.clone()])?.dense()?;
        let carry = t.complement().try_mul(&x.dense()?)?;
        Ok(Value::Dense(t.try_mul(&h.dense()?)?.try_add(&carry)?))
    }

    fn variables(&self) -> Vec<Variable> {
        self.transform.variables()
    }
}

/// # Residual (`residual`)
/// `projection(x) + h`, where `h` is computed from `x`.
///
/// The projection is `x` itself when the units match, and a bias-free [`Linear`] otherwise.
#[derive(Debug, Clone)]
pub struct Residual {
    pub projection: Option<Linear>,
}

impl Residual {
    pub fn build(x: &Layer, h: &Layer) -> Result<Layer, LayerError> {
        check_ancestor("residual", x, h)?;
        let name = unique_name("residual");
        let n_units = h.n_units();
        let projection = match x.n_units() == n_units {
            true => None,
            false => Some(Linear {
                weights: Variable::with_init(
                    &format!("{name}/projection/weights"),
                    [x.n_units(), n_units],
                    Init::GlorotUniform,
                    true,
                )?,
                bias: None,
                transpose_weights: false,
                activation: ActivationFn::Identity,
            }),
        };
        let shape = h.shape().clone();
        Ok(Layer::new(name, Residual { projection }, n_units, shape, &[x.clone(), h.clone()]))
    }
}

impl LayerOp for Residual {
    fn kind(&self) -> &'static str {
        "residual"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x, h] = check_arity(self.kind(), inputs)?;
        let x = match &self.projection {
            Some(projection) => projection.compute(&[x.clone()])?.dense()?,
            None => x.dense()?,
        };
        Ok(Value::Dense(x.try_add(&h.dense()?)?))
    }

    fn variables(&self) -> Vec<Variable> {
        self.projection
            .as_ref()
            .map(|projection| projection.variables())
            .unwrap_or_default()
    }
}

/// # Module (`module`)
/// Encapsulates the sub-graph between `inputs` and `output` as a single layer.
///
/// Reusing a module rebuilds the sub-graph on the new inputs, sharing its variables.
#[derive(Debug, Clone)]
pub struct Module {
    inputs: Vec<Layer>,
    output: Layer,
    graph: Graph,
    composed: bool,
}

impl Module {
    pub fn build(inputs: &[Layer], output: &Layer) -> Result<Layer, LayerError> {
        Self::build_named("module", inputs, output, false)
    }

    fn build_named(
        base: &str,
        inputs: &[Layer],
        output: &Layer,
        composed: bool,
    ) -> Result<Layer, LayerError> {
        let op = Self::create(inputs, output, composed)?;
        let name = unique_name(base);
        let (n_units, shape) = (output.n_units(), output.shape().clone());
        Ok(Layer::new(name, op, n_units, shape, inputs))
    }

    fn create(inputs: &[Layer], output: &Layer, composed: bool) -> Result<Self, LayerError> {
        let graph = Graph::build(inputs, &[output.clone()], false).map_err(Box::new)?;
        Ok(Self {
            inputs: inputs.to_vec(),
            output: output.clone(),
            graph,
            composed,
        })
    }

    /// The layer producing the module's output.
    #[inline]
    pub fn output(&self) -> &Layer {
        &self.output
    }

    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

/// Composes a chain of layers into a [`Module`] whose inputs are the inputs of the first layer
/// and whose output is the last layer.
pub fn compose(layers: &[Layer]) -> Result<Layer, LayerError> {
    let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
        return Err(LayerError::Invalid("nothing to compose".into()));
    };
    if let Some((prev, next)) = layers
        .iter()
        .tuple_windows()
        .find(|(prev, next)| !next.depends_on(prev))
    {
        return Err(LayerError::Invalid(format!(
            "compose: {next} does not depend on {prev}"
        )));
    }
    Module::build_named("compose", first.inputs(), last, true)
}

impl LayerOp for Module {
    fn kind(&self) -> &'static str {
        match self.composed {
            true => "compose",
            false => "module",
        }
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        if inputs.len() != self.inputs.len() {
            return Err(LayerError::Arity(self.kind(), self.inputs.len(), inputs.len()));
        }
        let feed: Feed = self
            .inputs
            .iter()
            .cloned()
            .zip_eq(inputs.iter().cloned())
            .collect();
        let mut outputs = self.graph.compute(&feed).map_err(Box::new)?;
        outputs.pop().ok_or(LayerError::Missing)
    }

    fn variables(&self) -> Vec<Variable> {
        self.graph.variables()
    }

    fn reuse(&self, inputs: &[Layer]) -> Result<Option<Box<dyn LayerOp>>, LayerError> {
        let mut mapping = self
            .inputs
            .iter()
            .cloned()
            .zip_eq(inputs.iter().cloned())
            .collect();
        let outputs = reuse_graph(&[self.output.clone()], &mut mapping)?;
        let output = outputs.into_iter().next().ok_or(LayerError::Missing)?;
        let op = Self::create(inputs, &output, self.composed)?;
        Ok(Some(Box::new(op)))
    }
}
