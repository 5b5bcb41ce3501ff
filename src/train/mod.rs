//! Training orchestration.
//!
//! A [`Model`] holds three graphs over the same layers: the run graph (inference), the train
//! graph (inputs to losses) and the eval graph (inputs to scores). Training reduces the losses,
//! backpropagates through the variables they depend on and applies the configured optimizer.

use std::path::Path;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    graph::{Feed, Graph, GraphError},
    layers::{Input, Layer, LayerError, Param, Value},
    loom::{
        num::DataType,
        ops::Gradients,
        tensor::{Tensor, TensorError},
        variable::Variable,
    },
};

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod optimizer;

use callbacks::{At, Callback, Context, Event, Property};
use checkpoint::CheckpointError;
use config::{Reduction, TrainConfig};
use optimizer::Optimizer;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model error: no optimizer configured")]
    NoOptimizer,
    #[error("model error: no {0} outputs")]
    NoOutputs(&'static str),
    #[error("model error: input {0} is not fed")]
    MissingFeed(String),
    #[error("model error: {0} loss weights for {1} losses")]
    LossWeights(usize, usize),
    #[error("model error: empty dataset")]
    EmptyDataset,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Processes gradients before the optimizer applies them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientOp {
    /// Rescales each gradient to at most this L2 norm.
    ClipNorm(f32),
    /// Clamps each gradient element into `[-x, x]`.
    ClipValue(f32),
    /// Rescales all gradients so that their joint L2 norm is at most this.
    ClipGlobalNorm(f32),
}

impl GradientOp {
    pub fn apply(&self, gradients: &mut Gradients) {
        let l2 = |grad: &Tensor| grad.data().iter().map(|x| x * x).sum::<f32>();
        match *self {
            GradientOp::ClipNorm(max) => {
                for (_, grad) in gradients.iter_mut() {
                    let norm = l2(grad).sqrt();
                    if norm > max {
                        *grad = grad.mul_scalar(max / norm);
                    }
                }
            }
            GradientOp::ClipValue(max) => {
                for (_, grad) in gradients.iter_mut() {
                    *grad = grad.clamp(-max, max);
                }
            }
            GradientOp::ClipGlobalNorm(max) => {
                let norm = gradients.iter().map(|(_, grad)| l2(grad)).sum::<f32>().sqrt();
                if norm > max {
                    for (_, grad) in gradients.iter_mut() {
                        *grad = grad.mul_scalar(max / norm);
                    }
                }
            }
        }
    }
}

/// One entry of a dataset: values for the input layers plus named properties,
/// which are exposed to callbacks while the batch is trained on.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub feed: Feed,
    pub properties: HashMap<String, Property>,
}

impl Batch {
    pub fn new(feed: impl IntoIterator<Item = (Layer, Value)>) -> Self {
        Self {
            feed: feed.into_iter().collect(),
            properties: Default::default(),
        }
    }

    pub fn property(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.properties.insert(name.to_owned(), value.into());
        self
    }
}

/// Inputs and outputs of one of the model graphs.
#[derive(Debug, Clone)]
struct Endpoints {
    inputs: Vec<Layer>,
    graph: Graph,
}

impl Endpoints {
    fn build(inputs: Vec<Layer>, outputs: Vec<Layer>) -> Result<Self, GraphError> {
        let graph = Graph::build(&inputs, &outputs, false)?;
        Ok(Self { inputs, graph })
    }

    /// Feeds the inputs and computes the outputs. Inputs holding a value may be left out.
    fn compute(&self, feed: &Feed) -> Result<Vec<Value>, ModelError> {
        let missing = self.inputs.iter().find(|input| {
            !feed.contains_key(*input)
                && input.is_input()
                && !input.op::<Input>().is_some_and(Input::has_value)
        });
        if let Some(input) = missing {
            return Err(ModelError::MissingFeed(input.name().to_owned()));
        }
        Ok(self.graph.compute(feed)?)
    }
}

#[derive(Debug, Clone)]
pub struct ModelBuilder {
    pub run_inputs: Vec<Layer>,
    pub run_outputs: Vec<Layer>,
    pub train_inputs: Option<Vec<Layer>>,
    pub train_loss: Vec<Layer>,
    pub loss_weights: Option<Vec<f32>>,
    pub eval_inputs: Option<Vec<Layer>>,
    pub eval_score: Vec<Layer>,
}

impl ModelBuilder {
    /// Sets the train inputs and the loss layers. Each loss layer yields per-example losses.
    pub fn train(mut self, inputs: &[Layer], loss: &[Layer]) -> Self {
        self.train_inputs = Some(inputs.to_vec());
        self.train_loss = loss.to_vec();
        self
    }

    /// Joins several losses with a weighted sum instead of a plain one.
    pub fn loss_weights(mut self, weights: &[f32]) -> Self {
        self.loss_weights = Some(weights.to_vec());
        self
    }

    pub fn eval(mut self, inputs: &[Layer], score: &[Layer]) -> Self {
        self.eval_inputs = Some(inputs.to_vec());
        self.eval_score = score.to_vec();
        self
    }

    pub fn build(self) -> Result<Model, ModelError> {
        let Self {
            run_inputs,
            run_outputs,
            train_inputs,
            train_loss,
            loss_weights,
            eval_inputs,
            eval_score,
        } = self;
        if run_outputs.is_empty() {
            return Err(ModelError::NoOutputs("run"));
        }
        if let Some(weights) = &loss_weights {
            if weights.len() != train_loss.len() {
                return Err(ModelError::LossWeights(weights.len(), train_loss.len()));
            }
        }

        // train and eval default to the run graph
        let train_inputs = train_inputs.unwrap_or_else(|| run_inputs.clone());
        let train_loss = match train_loss.is_empty() {
            true => run_outputs.clone(),
            false => train_loss,
        };
        let eval_inputs = eval_inputs.unwrap_or_else(|| run_inputs.clone());
        let eval_score = match eval_score.is_empty() {
            true => run_outputs.clone(),
            false => eval_score,
        };

        let run = Endpoints::build(run_inputs, run_outputs)?;
        let train = Endpoints::build(train_inputs, train_loss)?;
        let eval = Endpoints::build(eval_inputs, eval_score)?;
        log::debug!(
            "model: {} run, {} train, {} eval nodes",
            run.graph.nodes().len(),
            train.graph.nodes().len(),
            eval.graph.nodes().len()
        );

        Ok(Model {
            run,
            train,
            eval,
            loss_weights,
            optimizer: None,
            params: vec![],
            gradient_op: None,
        })
    }
}

/// # Model
/// Runs, trains and evaluates a layer graph.
///
/// ## Graphs
/// * `run` - `run_inputs` to `run_outputs`.
/// * `train` - train inputs to the loss layers. Defaults to the run graph.
/// * `eval` - eval inputs to the score layers. Defaults to the run graph.
#[derive(Debug)]
pub struct Model {
    run: Endpoints,
    train: Endpoints,
    eval: Endpoints,
    loss_weights: Option<Vec<f32>>,
    optimizer: Option<Box<dyn Optimizer>>,
    params: Vec<Param>,
    gradient_op: Option<GradientOp>,
}

impl Model {
    pub fn builder(run_inputs: &[Layer], run_outputs: &[Layer]) -> ModelBuilder {
        ModelBuilder {
            run_inputs: run_inputs.to_vec(),
            run_outputs: run_outputs.to_vec(),
            train_inputs: None,
            train_loss: vec![],
            loss_weights: None,
            eval_inputs: None,
            eval_score: vec![],
        }
    }

    #[inline]
    pub fn run_inputs(&self) -> &[Layer] {
        &self.run.inputs
    }

    #[inline]
    pub fn run_outputs(&self) -> &[Layer] {
        self.run.graph.out_nodes()
    }

    #[inline]
    pub fn run_graph(&self) -> &Graph {
        &self.run.graph
    }

    #[inline]
    pub fn train_graph(&self) -> &Graph {
        &self.train.graph
    }

    #[inline]
    pub fn eval_graph(&self) -> &Graph {
        &self.eval.graph
    }

    /// Sets the optimizer. Its params and `params` become model properties, named after them.
    pub fn config_optimizer(
        &mut self,
        optimizer: impl Optimizer + 'static,
        params: &[Param],
        gradient_op: Option<GradientOp>,
    ) {
        self.config_boxed_optimizer(Box::new(optimizer), params, gradient_op)
    }

    pub fn config_boxed_optimizer(
        &mut self,
        optimizer: Box<dyn Optimizer>,
        params: &[Param],
        gradient_op: Option<GradientOp>,
    ) {
        self.params = optimizer
            .params()
            .into_iter()
            .chain(params.iter().cloned())
            .unique_by(|param| param.name().to_owned())
            .collect();
        self.optimizer = Some(optimizer);
        self.gradient_op = gradient_op;
    }

    /// Named params exposed as properties during training.
    #[inline]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Every variable of the run, train and eval graphs.
    pub fn variables(&self) -> Vec<Variable> {
        [&self.run, &self.train, &self.eval]
            .into_iter()
            .flat_map(|endpoints| endpoints.graph.variables())
            .unique()
            .collect()
    }

    /// Variables updated by [`Model::train_step`].
    pub fn trainable_variables(&self) -> Vec<Variable> {
        self.train
            .graph
            .variables()
            .into_iter()
            .filter(Variable::trainable)
            .collect()
    }

    /// Re-runs the initializers of every variable.
    pub fn init_vars(&self) -> Result<(), ModelError> {
        for variable in self.variables() {
            variable.reinit()?;
        }
        Ok(())
    }

    /// Computes the run outputs.
    #[cfg_attr(feature = "trace", tracing::instrument(name = "model::run_step", skip_all))]
    pub fn run_step(&self, feed: &Feed) -> Result<Vec<Value>, ModelError> {
        self.run.compute(feed)
    }

    /// Reduces the outputs of the loss layers to a scalar tensor.
    /// Without loss weights only the first loss is used.
    fn joint_loss(&self, losses: Vec<Value>, reduction: Reduction) -> Result<Tensor, ModelError> {
        let reduced = losses
            .into_iter()
            .map(|loss| {
                let loss = loss.dense()?;
                Ok(match reduction {
                    Reduction::Mean => loss.mean_all()?,
                    Reduction::Sum => loss.sum_all()?,
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        let Some(weights) = &self.loss_weights else {
            return reduced.into_iter().next().ok_or(ModelError::NoOutputs("train"));
        };
        let mut joint = Tensor::scalar(0.0);
        for (loss, &weight) in reduced.iter().zip_eq(weights) {
            joint = joint.try_add(&loss.mul_scalar(weight))?;
        }
        Ok(joint)
    }

    /// # Train Step (`train_step`)
    /// Computes the losses, backpropagates and applies the optimizer.
    ///
    /// ## Returns
    /// * `Result<f32, ModelError>` - The joint loss before the update.
    pub fn train_step(&mut self, feed: &Feed) -> Result<f32, ModelError> {
        self.train_step_with(feed, Reduction::Mean)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "model::train_step", skip_all))]
    fn train_step_with(&mut self, feed: &Feed, reduction: Reduction) -> Result<f32, ModelError> {
        if self.optimizer.is_none() {
            return Err(ModelError::NoOptimizer);
        }
        let losses = self.train.compute(feed)?;
        let loss = self.joint_loss(losses, reduction)?;
        let value = loss.item()?;

        let mut gradients = loss.backward()?;
        if let Some(op) = &self.gradient_op {
            op.apply(&mut gradients);
        }
        let variables = self.trainable_variables();
        let optimizer = self.optimizer.as_mut().ok_or(ModelError::NoOptimizer)?;
        for variable in &variables {
            if let Some(grad) = gradients.get(variable) {
                optimizer.apply(variable, grad)?;
            }
        }
        Ok(value)
    }

    /// Mean of the eval scores.
    #[cfg_attr(feature = "trace", tracing::instrument(name = "model::eval_step", skip_all))]
    pub fn eval_step(&self, feed: &Feed) -> Result<f32, ModelError> {
        let scores = self.eval.compute(feed)?;
        let mut total = 0.0;
        for score in &scores {
            total += score.dense()?.mean_all()?.item()?;
        }
        Ok(total / scores.len().max(1) as f32)
    }

    /// Saves every variable to a safetensors checkpoint.
    pub fn save(&self, path: impl AsRef<Path>, r#type: DataType) -> Result<(), ModelError> {
        Ok(checkpoint::save(path, &self.variables(), r#type)?)
    }

    /// Loads every variable from a checkpoint written by [`Model::save`].
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        Ok(checkpoint::load(path, &self.variables())?)
    }

    /// Runs the callbacks that fire on `event`, then writes changed params back.
    fn dispatch(
        &self,
        event: Event,
        context: &mut Context,
        callbacks: &mut [Box<dyn Callback>],
        order: &[usize],
    ) -> Result<(), ModelError> {
        for &index in order {
            let callback = &mut callbacks[index];
            if callback.triggers().iter().any(|trigger| trigger.fires(event)) {
                callback.call(context, self)?;
            }
        }
        for param in &self.params {
            if let Some(value) = context.get_f32(param.name()) {
                param.set(value);
            }
        }
        Ok(())
    }

    /// # Train (`train`)
    /// Trains for `config.epochs` epochs over `dataset`, running `callbacks` along the way.
    ///
    /// ## Properties
    /// * `epoch`, `step` - Current epoch and step, counting from 1.
    /// * `last_loss` - Loss of the last step.
    /// * `train_loss` - Mean loss of the current epoch so far.
    /// * Optimizer params, by name.
    /// * Properties of the current batch.
    ///
    /// ## Returns
    /// * `Result<Context, ModelError>` - The properties at the end of training.
    pub fn train(
        &mut self,
        dataset: &[Batch],
        config: &TrainConfig,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<Context, ModelError> {
        if dataset.is_empty() {
            return Err(ModelError::EmptyDataset);
        }
        if self.optimizer.is_none() {
            return Err(ModelError::NoOptimizer);
        }
        let order = (0..callbacks.len())
            .sorted_by_key(|&index| callbacks[index].priority())
            .collect_vec();
        let steps_per_epoch = config.steps_per_epoch.unwrap_or(dataset.len());

        let mut context = Context::default();
        for param in &self.params {
            context.set(param.name(), param.get());
        }
        self.dispatch(Event::Loop(At::Start), &mut context, callbacks, &order)?;

        let mut step = 0;
        'epochs: for epoch in 1..=config.epochs {
            context.set("epoch", epoch);
            self.dispatch(Event::Epoch(epoch, At::Start), &mut context, callbacks, &order)?;

            let mut epoch_loss = 0.0;
            for (index, batch) in dataset.iter().cycle().take(steps_per_epoch).enumerate() {
                step += 1;
                context.set("step", step);
                for (name, value) in &batch.properties {
                    context.set(name, value.clone());
                }
                self.dispatch(Event::Step(step, At::Start), &mut context, callbacks, &order)?;

                let loss = self.train_step_with(&batch.feed, config.reduction)?;
                if !loss.is_finite() {
                    log::warn!("step {step}: loss is {loss}");
                }
                epoch_loss += loss;
                context.set("last_loss", loss);
                context.set("train_loss", epoch_loss / (index + 1) as f32);
                for param in &self.params {
                    context.set(param.name(), param.get());
                }

                self.dispatch(Event::Step(step, At::End), &mut context, callbacks, &order)?;
                if context.stop_requested() {
                    break 'epochs;
                }
            }

            self.dispatch(Event::Epoch(epoch, At::End), &mut context, callbacks, &order)?;
            if context.stop_requested() {
                break;
            }
        }
        log::debug!("training stopped after {step} steps");

        self.dispatch(Event::Loop(At::End), &mut context, callbacks, &order)?;
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::{Batch, GradientOp, Model, ModelError};
    use crate::{
        activation::Activation as ActivationFn,
        graph::Feed,
        layers::{Activation, Input, Lambda, Layer, Linear, Value},
        loom::{ops::Gradients, tensor::Tensor, variable::Variable},
        loss,
        random,
        train::optimizer::Sgd,
    };

    fn logistic() -> Result<(Layer, Layer, Layer, Layer), Box<dyn Error>> {
        let x = Input::builder(4).name("inputs").build()?;
        let h = Activation::build(&Linear::builder(2).build(&x)?, ActivationFn::Sigmoid)?;
        let labels = Input::builder(2).name("labels").build()?;
        let loss = Lambda::builder(|inputs| {
            let [labels, logits] = [inputs[0].dense()?, inputs[1].dense()?];
            Ok(Value::Dense(loss::mse(&labels, &logits)?))
        })
        .n_units(Some(1))
        .build(&[labels.clone(), h.clone()])?;
        Ok((x, h, labels, loss))
    }

    #[test]
    fn test_run_step() -> Result<(), Box<dyn Error>> {
        random::seed(3);
        let (x, h, _, _) = logistic()?;
        let model = Model::builder(&[x.clone()], &[h.clone()]).build()?;

        let feed = Feed::from_iter([(x.clone(), Tensor::ones([3, 4]).into())]);
        let outputs = model.run_step(&feed)?;
        assert_eq!(outputs[0].shape(), &[3, 2]);
        assert!(matches!(model.run_step(&Feed::default()), Err(ModelError::MissingFeed(_))));

        // re-initialization changes the outputs
        let before = model.run_step(&feed)?;
        model.init_vars()?;
        assert_ne!(model.run_step(&feed)?, before);
        Ok(())
    }

    #[test]
    fn test_train_step() -> Result<(), Box<dyn Error>> {
        random::seed(5);
        let (x, h, labels, loss) = logistic()?;
        let mut model = Model::builder(&[x.clone()], &[h])
            .train(&[x.clone(), labels.clone()], &[loss.clone()])
            .eval(&[x.clone(), labels.clone()], &[loss])
            .build()?;
        assert_eq!(model.trainable_variables().len(), 2);

        let feed = Feed::from_iter([
            (x.clone(), Tensor::ones([1, 4]).into()),
            (labels.clone(), Tensor::create([1, 2], vec![1.0, 0.0])?.into()),
        ]);
        assert!(matches!(model.train_step(&feed), Err(ModelError::NoOptimizer)));

        model.config_optimizer(Sgd::new(0.5), &[], None);
        let weights = model.trainable_variables()[0].value();
        let first = model.train_step(&feed)?;
        for _ in 0..20 {
            model.train_step(&feed)?;
        }
        assert_ne!(model.trainable_variables()[0].value(), weights);
        assert!(model.eval_step(&feed)? < first);

        let partial = Feed::from_iter([(x, Tensor::ones([1, 4]).into())]);
        assert!(matches!(model.train_step(&partial), Err(ModelError::MissingFeed(_))));
        Ok(())
    }

    #[test]
    fn test_gradient_ops() -> Result<(), Box<dyn Error>> {
        let a = Variable::new("a", Tensor::zeros([2]));
        let b = Variable::new("b", Tensor::zeros([2]));
        let gradients = || {
            let mut gradients = Gradients::default();
            gradients.insert(a.id(), Tensor::vector(vec![3.0, 4.0]));
            gradients.insert(b.id(), Tensor::vector(vec![0.0, 0.5]));
            gradients
        };

        let mut clipped = gradients();
        GradientOp::ClipNorm(1.0).apply(&mut clipped);
        assert_abs_diff_eq!(clipped.get(&a).ok_or("a")?.data(), &[0.6, 0.8][..], epsilon = 1e-6);
        assert_eq!(clipped.get(&b).ok_or("b")?.data(), &[0.0, 0.5]);

        let mut clipped = gradients();
        GradientOp::ClipValue(1.0).apply(&mut clipped);
        assert_eq!(clipped.get(&a).ok_or("a")?.data(), &[1.0, 1.0]);

        let mut clipped = gradients();
        GradientOp::ClipGlobalNorm(2.0).apply(&mut clipped);
        let norm = clipped
            .iter()
            .flat_map(|(_, grad)| grad.to_vec())
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt();
        assert_abs_diff_eq!(norm, 2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_loss_weights() -> Result<(), Box<dyn Error>> {
        random::seed(7);
        let (x, h, labels, loss) = logistic()?;
        let half = Lambda::builder(|inputs| Ok(Value::Dense(inputs[0].dense()?.mul_scalar(0.5))))
            .build(&[loss.clone()])?;
        let inputs = [x.clone(), labels.clone()];

        let result = Model::builder(&[x.clone()], &[h.clone()])
            .train(&inputs, &[loss.clone(), half.clone()])
            .loss_weights(&[1.0])
            .build();
        assert!(matches!(result, Err(ModelError::LossWeights(1, 2))));

        let mut model = Model::builder(&[x.clone()], &[h])
            .train(&inputs, &[loss, half])
            .loss_weights(&[1.0, 2.0])
            .build()?;
        model.config_optimizer(Sgd::new(0.0), &[], None);

        let batch = Batch::new([
            (x, Tensor::ones([1, 4]).into()),
            (labels, Tensor::zeros([1, 2]).into()),
        ]);
        // loss + 2 * loss / 2
        let joint = model.train_step(&batch.feed)?;
        let score = model.train.compute(&batch.feed)?[0].dense()?.mean_all()?.item()?;
        assert_abs_diff_eq!(joint, 2.0 * score, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_first_loss_without_weights() -> Result<(), Box<dyn Error>> {
        random::seed(7);
        let (x, h, labels, loss) = logistic()?;
        let double = Lambda::builder(|inputs| Ok(Value::Dense(inputs[0].dense()?.mul_scalar(2.0))))
            .build(&[loss.clone()])?;
        let mut model = Model::builder(&[x.clone()], &[h])
            .train(&[x.clone(), labels.clone()], &[loss, double])
            .build()?;
        model.config_optimizer(Sgd::new(0.0), &[], None);

        let batch = Batch::new([
            (x, Tensor::ones([1, 4]).into()),
            (labels, Tensor::zeros([1, 2]).into()),
        ]);
        let joint = model.train_step(&batch.feed)?;
        let first = model.train.compute(&batch.feed)?[0].dense()?.mean_all()?.item()?;
        assert_abs_diff_eq!(joint, first, epsilon = 1e-6);
        Ok(())
    }
}
