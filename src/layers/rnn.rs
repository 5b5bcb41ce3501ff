//! Recurrent cells and their unrolling over sequences.
//!
//! A cell layer computes one step: its inputs are `x` followed by the previous states, which
//! default to [`zero_state`]. Feeding a cell its own output (or a cell reused from it) chains
//! steps with shared variables.

use std::any::Any;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{
    Lambda, Layer, LayerError, LayerOp, Shape, Value, check_arity, impl_setters, unique_name,
};
use crate::{
    activation::Activation as ActivationFn,
    init::Init,
    loom::{tensor::Tensor, variable::Variable},
};

/// A single recurrent step.
pub trait RecurrentCell: LayerOp {
    /// Number of state tensors, each `[batch, n_units]`.
    fn n_states(&self) -> usize;

    fn n_units(&self) -> usize;

    /// Computes the next states from `x` and the previous states. The first one is the output.
    fn step(&self, x: &Tensor, states: &[Tensor]) -> Result<Vec<Tensor>, LayerError>;
}

dyn_clone::clone_trait_object!(RecurrentCell);

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Rnn,
    Gru,
    Lstm,
}

impl CellKind {
    #[inline]
    pub fn n_states(self) -> usize {
        match self {
            CellKind::Rnn | CellKind::Gru => 1,
            CellKind::Lstm => 2,
        }
    }

    fn n_gates(self) -> usize {
        match self {
            CellKind::Rnn => 1,
            CellKind::Gru => 3,
            CellKind::Lstm => 4,
        }
    }
}

/// Zero states `[batch, n_units]`, with the batch size of `input`.
pub fn zero_state(input: &Layer, n_units: usize) -> Result<Layer, LayerError> {
    Lambda::builder(move |inputs| {
        let [x] = check_arity("zero_state", inputs)?;
        let layout = x.layout();
        let batch = layout.size() / layout.last().max(1);
        Ok(Value::Dense(Tensor::zeros([batch, n_units])))
    })
    .name("zero_state")
    .n_units(Some(n_units))
    .shape(Some(Shape::with_units(input.shape(), n_units)))
    .build(&[input.clone()])
}

/// Input, recurrent and bias variables of a cell with `n_gates` stacked gates.
#[derive(Debug, Clone)]
struct Kernels {
    w: Variable,
    u: Variable,
    bias: Variable,
    n_units: usize,
}

impl Kernels {
    fn create(
        name: &str,
        n_in: usize,
        n_units: usize,
        n_gates: usize,
        init: (Init, Init),
    ) -> Result<Self, LayerError> {
        let (w_init, u_init) = init;
        let w = Variable::with_init(&format!("{name}/w"), [n_in, n_gates * n_units], w_init, true)?;
        let u = Variable::with_init(
            &format!("{name}/u"),
            [n_units, n_gates * n_units],
            u_init,
            true,
        )?;
        let bias = Variable::with_init(
            &format!("{name}/bias"),
            [n_gates * n_units],
            Init::Zeros,
            true,
        )?;
        Ok(Self {
            w,
            u,
            bias,
            n_units,
        })
    }

    #[inline]
    fn n_gates(&self) -> usize {
        self.bias.layout().last() / self.n_units.max(1)
    }

    /// `x·W + b`, split into gates.
    fn input_gates(&self, x: &Tensor) -> Result<Vec<Tensor>, LayerError> {
        let xw = x.matmul(&self.w.value())?.try_add(&self.bias.value())?;
        Ok(xw.split(-1, self.n_gates())?)
    }

    /// `x·W + h·U + b`, split into gates.
    fn gates(&self, x: &Tensor, h: &Tensor) -> Result<Vec<Tensor>, LayerError> {
        let xw = x.matmul(&self.w.value())?;
        let hu = h.matmul(&self.u.value())?;
        let sum = xw.try_add(&hu)?.try_add(&self.bias.value())?;
        Ok(sum.split(-1, self.n_gates())?)
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.w.clone(), self.u.clone(), self.bias.clone()]
    }
}

/// # Simple RNN Cell (`rnn_cell`)
/// `h = activation(x·W + h_prev·U + b)`.
#[derive(Debug, Clone)]
pub struct RnnCell {
    kernels: Kernels,
    pub activation: ActivationFn,
}

/// # GRU Cell (`gru_cell`)
/// ```text
/// z = sigmoid(x·Wz + h·Uz + bz)
/// r = sigmoid(x·Wr + h·Ur + br)
/// c = tanh(x·Wc + (r * h)·Uc + bc)
/// h' = z * h + (1 - z) * c
/// ```
#[derive(Debug, Clone)]
pub struct GruCell {
    kernels: Kernels,
}

/// Which state an [`LstmCell`] layer outputs.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LstmOutput {
    #[default]
    State,
    Memory,
}

/// # LSTM Cell (`lstm_cell`)
/// Inputs are `x`, the previous state `h` and the previous memory `c`:
/// ```text
/// i, f, o, g = x·W + h·U + b
/// c' = sigmoid(f + forget_bias) * c + sigmoid(i) * tanh(g)
/// h' = sigmoid(o) * tanh(c')
/// ```
/// The layer outputs `h'`. [`LstmCell::memory`] gives a layer with `c'` instead.
#[derive(Debug, Clone)]
pub struct LstmCell {
    kernels: Kernels,
    pub forget_bias: f32,
    pub output: LstmOutput,
}

impl RnnCell {
    pub fn builder(n_units: usize) -> CellBuilder {
        CellBuilder::new(CellKind::Rnn, n_units)
    }
}

impl GruCell {
    pub fn builder(n_units: usize) -> CellBuilder {
        CellBuilder::new(CellKind::Gru, n_units)
    }
}

impl LstmCell {
    pub fn builder(n_units: usize) -> CellBuilder {
        CellBuilder::new(CellKind::Lstm, n_units)
    }

    /// A layer giving the memory state of `cell`, computed from the same inputs.
    pub fn memory(cell: &Layer) -> Result<Layer, LayerError> {
        cell.reuse_map::<LstmCell>(cell.inputs(), |op| op.output = LstmOutput::Memory)
    }
}

/// Builds any of the recurrent cells.
#[derive(Debug, Clone)]
pub struct CellBuilder {
    pub name: Option<String>,
    pub kind: CellKind,
    pub n_units: usize,
    pub activation: ActivationFn,
    pub w_init: Init,
    pub u_init: Init,
    pub forget_bias: f32,
    /// A cell layer of the same kind whose variables are reused.
    pub share_vars_with: Option<Layer>,
}

impl_setters!(CellBuilder {
    activation: ActivationFn,
    w_init: Init,
    u_init: Init,
    forget_bias: f32,
    share_vars_with: Option<Layer>,
});

impl CellBuilder {
    fn new(kind: CellKind, n_units: usize) -> Self {
        Self {
            name: None,
            kind,
            n_units,
            activation: ActivationFn::Tanh,
            w_init: Init::GlorotUniform,
            u_init: Init::GlorotUniform,
            forget_bias: 1.0,
            share_vars_with: None,
        }
    }

    /// Creates the cell op for inputs of `n_in` units.
    pub fn cell(&self, name: &str, n_in: usize) -> Result<Box<dyn RecurrentCell>, LayerError> {
        let kernels = match &self.share_vars_with {
            Some(layer) => {
                let kernels = kernels_of(layer)
                    .ok_or_else(|| LayerError::Downcast(layer.name().to_owned(), "cell"))?;
                let [rows, _] = kernels.w.layout().try_to_array()?;
                if rows != n_in || kernels.n_units != self.n_units {
                    return Err(LayerError::Invalid(format!(
                        "can not share the variables of {layer}: shapes differ"
                    )));
                }
                kernels
            }
            None => Kernels::create(
                name,
                n_in,
                self.n_units,
                self.kind.n_gates(),
                (self.w_init, self.u_init),
            )?,
        };
        let expected = self.kind.n_gates() * self.n_units;
        if kernels.bias.layout().last() != expected {
            return Err(LayerError::Invalid(format!(
                "can not share {} gates with a {} cell",
                kernels.bias.layout().last() / self.n_units.max(1),
                self.kind
            )));
        }
        let cell: Box<dyn RecurrentCell> = match self.kind {
            CellKind::Rnn => Box::new(RnnCell {
                kernels,
                activation: self.activation,
            }),
            CellKind::Gru => Box::new(GruCell { kernels }),
            CellKind::Lstm => Box::new(LstmCell {
                kernels,
                forget_bias: self.forget_bias,
                output: LstmOutput::State,
            }),
        };
        Ok(cell)
    }

    /// Builds a cell layer. Missing previous states are zero states.
    pub fn build(self, input: &Layer, states: &[Option<Layer>]) -> Result<Layer, LayerError> {
        let n_states = self.kind.n_states();
        if states.len() > n_states {
            return Err(LayerError::Arity(cell_kind(self.kind), n_states + 1, states.len() + 1));
        }
        let name = unique_name(self.name.as_deref().unwrap_or(cell_kind(self.kind)));
        let cell = self.cell(&name, input.n_units())?;

        let mut inputs = vec![input.clone()];
        for index in 0..n_states {
            let state = match states.get(index).cloned().flatten() {
                Some(state) if state.n_units() != self.n_units => {
                    return Err(LayerError::Invalid(format!(
                        "state {state} has {} units, expected {}",
                        state.n_units(),
                        self.n_units
                    )));
                }
                Some(state) => state,
                None => zero_state(input, self.n_units)?,
            };
            inputs.push(state);
        }
        let shape = Shape::with_units(input.shape(), self.n_units);
        Ok(Layer::from_box(name, cell, self.n_units, shape, &inputs))
    }
}

#[inline]
fn cell_kind(kind: CellKind) -> &'static str {
    match kind {
        CellKind::Rnn => "rnn_cell",
        CellKind::Gru => "gru_cell",
        CellKind::Lstm => "lstm_cell",
    }
}

/// Variables of a cell layer, or of the cell of an [`Rnn`] layer.
fn kernels_of(layer: &Layer) -> Option<Kernels> {
    let op: &dyn Any = match layer.op::<Rnn>() {
        Some(rnn) => rnn.cell.as_ref(),
        None => layer.op_dyn(),
    };
    if let Some(cell) = op.downcast_ref::<RnnCell>() {
        return Some(cell.kernels.clone());
    }
    if let Some(cell) = op.downcast_ref::<GruCell>() {
        return Some(cell.kernels.clone());
    }
    op.downcast_ref::<LstmCell>().map(|cell| cell.kernels.clone())
}

/// Densifies `x` and the states, then runs one step.
fn compute_step(cell: &dyn RecurrentCell, inputs: &[Value]) -> Result<Vec<Tensor>, LayerError> {
    let n_states = cell.n_states();
    if inputs.len() != n_states + 1 {
        return Err(LayerError::Arity(cell.kind(), n_states + 1, inputs.len()));
    }
    let x = inputs[0].dense()?;
    let states = inputs[1..]
        .iter()
        .map(Value::dense)
        .collect::<Result<Vec<_>, _>>()?;
    cell.step(&x, &states)
}

impl RecurrentCell for RnnCell {
    fn n_states(&self) -> usize {
        1
    }

    fn n_units(&self) -> usize {
        self.kernels.n_units
    }

    fn step(&self, x: &Tensor, states: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        let [h] = states else {
            return Err(LayerError::Arity(self.kind(), 2, states.len() + 1));
        };
        let gates = self.kernels.gates(x, h)?;
        let h = self.activation.apply(&gates[0])?;
        Ok(vec![h])
    }
}

impl LayerOp for RnnCell {
    fn kind(&self) -> &'static str {
        "rnn_cell"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let mut states = compute_step(self, inputs)?;
        Ok(Value::Dense(states.swap_remove(0)))
    }

    fn variables(&self) -> Vec<Variable> {
        self.kernels.variables()
    }
}

impl RecurrentCell for GruCell {
    fn n_states(&self) -> usize {
        1
    }

    fn n_units(&self) -> usize {
        self.kernels.n_units
    }

    fn step(&self, x: &Tensor, states: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        let [h] = states else {
            return Err(LayerError::Arity(self.kind(), 2, states.len() + 1));
        };
        let xw = self.kernels.input_gates(x)?;
        let u = self.kernels.u.value().split(-1, 3)?;

        let z = xw[0].try_add(&h.matmul(&u[0])?)?.sigmoid();
        let r = xw[1].try_add(&h.matmul(&u[1])?)?.sigmoid();
        let candidate = xw[2].try_add(&r.try_mul(h)?.matmul(&u[2])?)?.tanh();

        let h = z.try_mul(h)?.try_add(&z.complement().try_mul(&candidate)?)?;
        Ok(vec![h])
    }
}

impl LayerOp for GruCell {
    fn kind(&self) -> &'static str {
        "gru_cell"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let mut states = compute_step(self, inputs)?;
        Ok(Value::Dense(states.swap_remove(0)))
    }

    fn variables(&self) -> Vec<Variable> {
        self.kernels.variables()
    }
}

impl RecurrentCell for LstmCell {
    fn n_states(&self) -> usize {
        2
    }

    fn n_units(&self) -> usize {
        self.kernels.n_units
    }

    fn step(&self, x: &Tensor, states: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        let [h, c] = states else {
            return Err(LayerError::Arity(self.kind(), 3, states.len() + 1));
        };
        let [i, f, o, g]: [Tensor; 4] = self
            .kernels
            .gates(x, h)?
            .try_into()
            .map_err(|gates: Vec<Tensor>| LayerError::Arity(self.kind(), 4, gates.len()))?;

        let forget = f.add_scalar(self.forget_bias).sigmoid();
        let c = forget.try_mul(c)?.try_add(&i.sigmoid().try_mul(&g.tanh())?)?;
        let h = o.sigmoid().try_mul(&c.tanh())?;
        Ok(vec![h, c])
    }
}

impl LayerOp for LstmCell {
    fn kind(&self) -> &'static str {
        "lstm_cell"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let mut states = compute_step(self, inputs)?;
        let index = match self.output {
            LstmOutput::State => 0,
            LstmOutput::Memory => 1,
        };
        Ok(Value::Dense(states.swap_remove(index)))
    }

    fn variables(&self) -> Vec<Variable> {
        self.kernels.variables()
    }
}

/// # Recurrent Layer (`rnn`)
/// Unrolls a cell over `[batch, time, n_in]` sequences, starting from zero states,
/// and outputs every step's state as `[batch, time, n_units]`.
#[derive(Debug, Clone)]
pub struct Rnn {
    pub cell: Box<dyn RecurrentCell>,
    pub reverse: bool,
}

#[derive(Debug, Clone)]
pub struct RnnBuilder {
    pub name: Option<String>,
    pub cell: CellBuilder,
    pub reverse: bool,
}

impl_setters!(RnnBuilder {
    cell: CellBuilder,
    reverse: bool,
});

impl Rnn {
    pub fn builder(kind: CellKind, n_units: usize) -> RnnBuilder {
        RnnBuilder {
            name: None,
            cell: CellBuilder::new(kind, n_units),
            reverse: false,
        }
    }
}

impl RnnBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let name = unique_name(self.name.as_deref().unwrap_or("rnn"));
        let cell = self.cell.cell(&format!("{name}/cell"), input.n_units())?;
        let n_units = cell.n_units();
        let shape = Shape::with_units(input.shape(), n_units);
        let op = Rnn {
            cell,
            reverse: self.reverse,
        };
        Ok(Layer::new(name, op, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for Rnn {
    fn kind(&self) -> &'static str {
        "rnn"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let x = x.dense()?;
        let [batch, time, _] = x.layout().try_to_array()?;
        let n_units = self.cell.n_units();

        let mut states = vec![Tensor::zeros([batch, n_units]); self.cell.n_states()];
        let mut outputs = Vec::with_capacity(time);
        let steps: Box<dyn Iterator<Item = usize>> = match self.reverse {
            true => Box::new((0..time).rev()),
            false => Box::new(0..time),
        };
        for t in steps {
            let x_t = x.slice((.., t))?;
            states = self.cell.step(&x_t, &states)?;
            outputs.push(states[0].expand_dims(1)?);
        }
        if self.reverse {
            outputs.reverse();
        }
        Ok(Value::Dense(Tensor::concat(&outputs, 1)?))
    }

    fn variables(&self) -> Vec<Variable> {
        self.cell.variables()
    }
}
