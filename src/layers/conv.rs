use super::{Layer, LayerError, LayerOp, Value, check_arity, impl_setters, unique_name};
use crate::{
    activation::Activation as ActivationFn,
    hal::ops::Padding,
    init::Init,
    loom::variable::Variable,
};

/// # 1D Convolution (`conv1d`)
/// Convolves `[batch, time, n_in]` sequences with filters of shape
/// `[filter_size, n_in, n_filters]`, giving `[batch, time', n_filters]`.
///
/// With [`Padding::Same`] and [`Padding::Causal`] the time axis keeps its length.
/// Causal convolutions only look at past steps.
#[derive(Debug, Clone)]
pub struct Conv1D {
    pub filters: Variable,
    pub bias: Option<Variable>,
    pub dilation: usize,
    pub padding: Padding,
    pub activation: ActivationFn,
}

#[derive(Debug, Clone)]
pub struct Conv1DBuilder {
    pub name: Option<String>,
    pub n_filters: usize,
    pub filter_size: usize,
    pub dilation: usize,
    pub padding: Padding,
    pub bias: bool,
    pub filter_init: Init,
    pub shared_filters: Option<Variable>,
    pub activation: ActivationFn,
}

impl_setters!(Conv1DBuilder {
    dilation: usize,
    padding: Padding,
    bias: bool,
    filter_init: Init,
    shared_filters: Option<Variable>,
    activation: ActivationFn,
});

impl Conv1D {
    pub fn builder(n_filters: usize, filter_size: usize) -> Conv1DBuilder {
        Conv1DBuilder {
            name: None,
            n_filters,
            filter_size,
            dilation: 1,
            padding: Padding::Same,
            bias: true,
            filter_init: Init::GlorotUniform,
            shared_filters: None,
            activation: ActivationFn::Identity,
        }
    }

    /// Shape of the filters, `[filter_size, n_in, n_filters]`.
    #[inline]
    pub fn filter_shape(&self) -> Vec<usize> {
        self.filters.layout().to_vec()
    }
}

/// Causal 1D convolution: a [`Conv1D`] with all padding on the left.
pub struct CausalConv;

impl CausalConv {
    #[inline]
    pub fn builder(n_filters: usize, filter_size: usize) -> Conv1DBuilder {
        Conv1D::builder(n_filters, filter_size)
            .name("causal_conv")
            .padding(Padding::Causal)
    }
}

impl Conv1DBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            n_filters,
            filter_size,
            dilation,
            padding,
            bias,
            filter_init,
            shared_filters,
            activation,
        } = self;
        let n_in = input.n_units();
        let name = unique_name(name.as_deref().unwrap_or("conv1d"));

        let filter_shape = [filter_size, n_in, n_filters];
        let filters = match shared_filters {
            Some(filters) if filters.layout().shape() == filter_shape => filters,
            Some(filters) => {
                return Err(LayerError::Invalid(format!(
                    "filters {} do not match {filter_shape:?}",
                    filters.layout()
                )));
            }
            None => Variable::with_init(&format!("{name}/filters"), filter_shape, filter_init, true)?,
        };
        let bias = match bias {
            true => Some(Variable::with_init(
                &format!("{name}/bias"),
                [n_filters],
                Init::Zeros,
                true,
            )?),
            false => None,
        };

        let op = Conv1D {
            filters,
            bias,
            dilation: dilation.max(1),
            padding,
            activation,
        };
        // the time axis is unknown for valid convolutions of unknown length
        let mut shape = input.shape().to_vec();
        if let Some(time) = shape.get_mut(1).filter(|_| padding == Padding::Valid) {
            let span = (filter_size.saturating_sub(1)) * dilation.max(1) + 1;
            *time = time.map(|time| (time + 1).saturating_sub(span));
        }
        if let Some(last) = shape.last_mut() {
            *last = Some(n_filters);
        }
        Ok(Layer::new(name, op, n_filters, shape.into(), &[input.clone()]))
    }
}

impl LayerOp for Conv1D {
    fn kind(&self) -> &'static str {
        "conv1d"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let x = x.dense()?;
        let y = x.conv1d(&self.filters.value(), self.dilation, self.padding)?;
        let y = match &self.bias {
            Some(bias) => y.try_add(&bias.value())?,
            None => y,
        };
        Ok(Value::Dense(self.activation.apply(&y)?))
    }

    fn variables(&self) -> Vec<Variable> {
        [Some(self.filters.clone()), self.bias.clone()]
            .into_iter()
            .flatten()
            .collect()
    }
}
