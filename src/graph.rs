//! Layer graphs: the nodes between a set of inputs and outputs, evaluated in dependency order.

use std::collections::VecDeque;

use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

use crate::{
    layers::{Layer, LayerError, Value},
    loom::variable::Variable,
};

/// Values fed to layers when computing a graph.
pub type Feed = HashMap<Layer, Value>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph build error: input {0} is not connected to any output")]
    Disconnected(String),
    #[error("graph build error: {0} is reached but is not an input")]
    MissingInput(String),
    #[error("graph error: layer {0} is not in the graph")]
    NotInGraph(String),
    #[error("graph compute error: layer {0}: {1}")]
    Layer(String, #[source] LayerError),
    #[error("graph error: no output")]
    Empty,
}

/// A directed acyclic graph of layers.
///
/// `in_nodes` are where evaluation starts: inputs given at build time or the sources reached
/// from the outputs. `out_nodes` are the layers whose values [`Graph::compute`] returns.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<Layer>,
    edges_in: HashMap<Layer, Vec<Layer>>,
    edges_out: HashMap<Layer, Vec<Layer>>,
    in_nodes: Vec<Layer>,
    out_nodes: Vec<Layer>,
}

impl Graph {
    /// # Build (`build`)
    /// Traverses the graph backwards from `outputs`.
    ///
    /// ## Arguments
    /// * `inputs` - Layers where the traversal stops. If empty, the sources reached become the
    ///   in-nodes.
    /// * `outputs` - The out-nodes, in order.
    /// * `missing_inputs` - Accepts feedable sources reached that are not among `inputs`,
    ///   adding them as in-nodes.
    ///
    /// ## Returns
    /// * `Result<Graph, GraphError>` - The graph, or an error if an input does not lead to any
    ///   output, or if a feedable source is reached that is not an input.
    pub fn build(
        inputs: &[Layer],
        outputs: &[Layer],
        missing_inputs: bool,
    ) -> Result<Self, GraphError> {
        let stops: HashSet<&Layer> = inputs.iter().collect();
        let mut graph = Self::default();
        let mut visited = HashSet::default();
        let mut missing = None;
        let mut queue: VecDeque<Layer> = outputs.iter().unique().cloned().collect();
        graph.out_nodes = queue.iter().cloned().collect();

        while let Some(layer) = queue.pop_front() {
            if !visited.insert(layer.clone()) {
                continue;
            }
            graph.nodes.push(layer.clone());

            if stops.contains(&layer) {
                graph.in_nodes.push(layer);
                continue;
            }
            if layer.inputs().is_empty() {
                if !inputs.is_empty() && layer.is_input() && !missing_inputs {
                    missing.get_or_insert_with(|| layer.name().to_owned());
                }
                graph.in_nodes.push(layer);
                continue;
            }
            for input in layer.inputs() {
                graph.add_edge(input, &layer);
                queue.push_back(input.clone());
            }
        }

        if let Some(input) = inputs.iter().find(|input| !visited.contains(*input)) {
            return Err(GraphError::Disconnected(input.name().to_owned()));
        }
        if let Some(name) = missing {
            return Err(GraphError::MissingInput(name));
        }
        log::debug!(
            "graph: {} nodes, in [{}], out [{}]",
            graph.nodes.len(),
            graph.in_nodes.iter().format(", "),
            graph.out_nodes.iter().format(", ")
        );
        Ok(graph)
    }

    fn add_edge(&mut self, from: &Layer, to: &Layer) {
        let targets = self.edges_out.entry(from.clone()).or_default();
        if !targets.contains(to) {
            targets.push(to.clone());
        }
        let sources = self.edges_in.entry(to.clone()).or_default();
        if !sources.contains(from) {
            sources.push(from.clone());
        }
    }

    /// Union of the nodes, edges, in-nodes and out-nodes of two graphs.
    pub fn merge(g1: &Graph, g2: &Graph) -> Graph {
        let union = |a: &[Layer], b: &[Layer]| a.iter().chain(b).unique().cloned().collect_vec();
        let mut graph = Graph {
            nodes: union(&g1.nodes, &g2.nodes),
            in_nodes: union(&g1.in_nodes, &g2.in_nodes),
            out_nodes: union(&g1.out_nodes, &g2.out_nodes),
            ..Default::default()
        };
        for g in [g1, g2] {
            for to in &g.nodes {
                for from in g.edges_in(to) {
                    graph.add_edge(from, to);
                }
            }
        }
        graph
    }

    /// Adds `layer` as a new out-node. Its inputs must already be in the graph.
    pub fn append_layer(&mut self, layer: &Layer) -> Result<(), GraphError> {
        if let Some(input) = layer.inputs().iter().find(|input| !self.contains(input)) {
            return Err(GraphError::NotInGraph(input.name().to_owned()));
        }
        if !self.contains(layer) {
            self.nodes.push(layer.clone());
            for input in layer.inputs() {
                self.add_edge(input, layer);
            }
        }
        if !self.out_nodes.contains(layer) {
            self.out_nodes.push(layer.clone());
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, layer: &Layer) -> bool {
        self.nodes.contains(layer)
    }

    /// Every node, in discovery order.
    #[inline]
    pub fn nodes(&self) -> &[Layer] {
        &self.nodes
    }

    #[inline]
    pub fn in_nodes(&self) -> &[Layer] {
        &self.in_nodes
    }

    #[inline]
    pub fn out_nodes(&self) -> &[Layer] {
        &self.out_nodes
    }

    /// The inputs of `layer` within the graph. In-nodes have none.
    #[inline]
    pub fn edges_in(&self, layer: &Layer) -> &[Layer] {
        self.edges_in.get(layer).map_or(&[], Vec::as_slice)
    }

    /// The layers of the graph that take `layer` as an input.
    #[inline]
    pub fn edges_out(&self, layer: &Layer) -> &[Layer] {
        self.edges_out.get(layer).map_or(&[], Vec::as_slice)
    }

    /// The longest distance of every node from the in-nodes.
    fn depths(&self) -> HashMap<Layer, usize> {
        let mut depths: HashMap<Layer, usize> = HashMap::default();
        for node in &self.nodes {
            let mut stack = vec![(node.clone(), false)];
            while let Some((layer, expanded)) = stack.pop() {
                if depths.contains_key(&layer) {
                    continue;
                }
                let inputs = self.edges_in(&layer);
                if expanded || inputs.is_empty() {
                    let depth = inputs
                        .iter()
                        .filter_map(|input| depths.get(input))
                        .max()
                        .map_or(0, |depth| depth + 1);
                    depths.insert(layer, depth);
                    continue;
                }
                let pending = inputs
                    .iter()
                    .filter(|input| !depths.contains_key(*input))
                    .map(|input| (input.clone(), false))
                    .collect_vec();
                stack.push((layer, true));
                stack.extend(pending);
            }
        }
        depths
    }

    /// Nodes ordered by their longest distance from the in-nodes. Ties keep discovery order.
    pub fn dependency_iter(&self) -> impl Iterator<Item = &Layer> {
        let depths = self.depths();
        self.nodes
            .iter()
            .sorted_by_key(|layer| depths.get(*layer).copied().unwrap_or_default())
    }

    /// Variables of every node, without duplicates, in dependency order.
    pub fn variables(&self) -> Vec<Variable> {
        self.dependency_iter()
            .flat_map(Layer::variables)
            .unique()
            .collect()
    }

    /// # Compute (`compute`)
    /// Evaluates the graph in dependency order.
    ///
    /// A fed input layer validates its value; any other fed layer takes the value as-is.
    /// Unfed input layers use their stored value, and other unfed in-nodes are evaluated
    /// from their own inputs.
    ///
    /// ## Returns
    /// * `Result<Vec<Value>, GraphError>` - The values of the out-nodes, in order.
    #[cfg_attr(feature = "trace", tracing::instrument(name = "graph::compute", skip_all))]
    pub fn compute(&self, feed: &Feed) -> Result<Vec<Value>, GraphError> {
        let in_nodes: HashSet<&Layer> = self.in_nodes.iter().collect();
        let mut values: HashMap<Layer, Value> = HashMap::default();

        for layer in self.dependency_iter() {
            let fail = |err: LayerError| GraphError::Layer(layer.name().to_owned(), err);
            let value = match feed.get(layer) {
                Some(value) if layer.is_input() => {
                    layer.op_dyn().feed(value.clone()).map_err(fail)?
                }
                Some(value) => value.clone(),
                None if in_nodes.contains(layer) && !layer.inputs().is_empty() => {
                    layer.compute().map_err(|err| fail(Box::new(err).into()))?
                }
                None => {
                    let inputs = layer
                        .inputs()
                        .iter()
                        .map(|input| {
                            values
                                .get(input)
                                .cloned()
                                .ok_or_else(|| GraphError::NotInGraph(input.name().to_owned()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    layer.op_dyn().compute(&inputs).map_err(fail)?
                }
            };
            log::trace!("computed {layer}: {}", value.layout());
            values.insert(layer.clone(), value);
        }

        self.out_nodes
            .iter()
            .map(|layer| {
                values
                    .get(layer)
                    .cloned()
                    .ok_or_else(|| GraphError::NotInGraph(layer.name().to_owned()))
            })
            .collect()
    }
}

/// The layers between `inputs` and `outputs`, in dependency order.
/// Sources reached that are not among `inputs` are listed too.
pub fn layers_to_list(outputs: &[Layer], inputs: &[Layer]) -> Result<Vec<Layer>, GraphError> {
    let graph = Graph::build(inputs, outputs, true)?;
    Ok(graph.dependency_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Feed, Graph, GraphError, layers_to_list};
    use crate::{
        activation::Activation as ActivationFn,
        layers::{
            Activation, Add, Constant, Input, Lambda, Layer, Linear, ToSparse, Value, Wrap,
        },
        loom::tensor::Tensor,
    };

    fn input(n_units: usize, name: &str) -> Result<Layer, Box<dyn Error>> {
        Ok(Input::builder(n_units).name(name).build()?)
    }

    #[test]
    fn test_graph_build() -> Result<(), Box<dyn Error>> {
        let x = input(1, "x")?;
        let g = Graph::build(&[], &[x.clone()], false)?;
        assert_eq!(g.in_nodes(), g.out_nodes());
        assert_eq!(g.in_nodes().len(), 1);

        let l1 = Linear::builder(2).build(&x)?;
        let l2 = Linear::builder(2).build(&x)?;
        let l3 = Linear::builder(2).build(&x)?;

        let g1 = Graph::build(&[], &[l1.clone()], false)?;
        assert_eq!(g1.in_nodes(), &[x.clone()]);
        assert_eq!(g1.out_nodes(), &[l1.clone()]);

        let g2 = Graph::build(&[x.clone()], &[l1.clone()], false)?;
        assert_eq!(g1.in_nodes(), g2.in_nodes());

        let err = Graph::build(&[l2.clone(), l3.clone()], &[l1.clone()], false);
        assert!(matches!(err, Err(GraphError::Disconnected(_))));

        let g = Graph::build(&[x.clone()], &[l2.clone(), l3.clone()], false)?;
        assert_eq!(g.edges_out(&x), &[l2.clone(), l3.clone()]);
        assert_eq!(g.edges_in(&l2), &[x.clone()]);
        assert!(g.edges_in(&x).is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_inputs() -> Result<(), Box<dyn Error>> {
        let x = input(1, "x")?;
        let l1 = Linear::builder(2).name("l1").build(&x)?;
        let l2 = Linear::builder(2).name("l2").build(&x)?;
        let l3 = Add::build(&[l1.clone(), l2])?;

        let err = Graph::build(&[l1.clone()], &[l3.clone()], false);
        assert!(matches!(err, Err(GraphError::MissingInput(_))));

        let g = Graph::build(&[l1.clone()], &[l3], true)?;
        assert_eq!(g.in_nodes().len(), 2);
        assert!(g.in_nodes().contains(&x));
        assert!(g.in_nodes().contains(&l1));

        // constants are never fed, so they need not be listed
        let c = Constant::build(Tensor::ones([1, 2]))?;
        let sum = Add::build(&[l1.clone(), c.clone()])?;
        let g = Graph::build(&[l1], &[sum], false)?;
        assert!(g.in_nodes().contains(&c));
        Ok(())
    }

    #[test]
    fn test_graph_merge() -> Result<(), Box<dyn Error>> {
        let x = input(1, "x")?;
        let l1 = Linear::builder(2).build(&x)?;
        let l2 = Linear::builder(2).build(&x)?;
        let l3 = Linear::builder(2).build(&l2)?;

        let g1 = Graph::build(&[], &[l1.clone()], false)?;
        let g2 = Graph::build(&[], &[l3.clone()], false)?;
        assert_eq!(g1.in_nodes(), g2.in_nodes());
        assert_ne!(g1.out_nodes(), g2.out_nodes());

        let g3 = Graph::merge(&g1, &g2);
        assert_eq!(g3.in_nodes(), &[x.clone()]);
        assert_eq!(g3.out_nodes(), &[l1.clone(), l3.clone()]);
        assert_eq!(g3.nodes().len(), 4);
        assert_eq!(g3.edges_out(&x), &[l1, l2]);
        Ok(())
    }

    #[test]
    fn test_dependency_iter() -> Result<(), Box<dyn Error>> {
        let x = input(2, "x")?;
        let y = Linear::builder(2).name("y").build(&x)?;
        let out1 = Activation::build(&y, ActivationFn::Softmax)?;
        let out2 = Activation::build(&y, ActivationFn::Softmax)?;

        let graph = Graph::build(&[], &[out1.clone(), out2.clone()], false)?;
        let order = graph.dependency_iter().cloned().collect::<Vec<_>>();
        assert_eq!(order, vec![x.clone(), y.clone(), out1.clone(), out2.clone()]);

        let list = layers_to_list(&[out1.clone(), out2.clone()], &[x.clone()])?;
        assert_eq!(list, order);

        // longest path decides the order
        let x1 = input(1, "x1")?;
        let x2 = input(1, "x2")?;
        let x3 = input(1, "x3")?;
        let h = Add::build(&[x1.clone(), x2.clone()])?;
        let z = Add::build(&[x3.clone(), h.clone()])?;
        let graph = Graph::build(&[], &[z.clone()], false)?;
        let order = graph.dependency_iter().cloned().collect::<Vec<_>>();
        assert_eq!(order.last(), Some(&z));
        assert_eq!(order.get(3), Some(&h));
        Ok(())
    }

    #[test]
    fn test_layers_to_list() -> Result<(), Box<dyn Error>> {
        let in1 = input(1, "in1")?;
        let in2 = input(1, "in2")?;
        let wrap = Wrap::build(&in2, None, Ok)?;
        let l2 = Add::build(&[in1.clone(), wrap])?;
        let l3 = Linear::builder(1).build(&l2)?;
        let l4 = Add::build(&[l3.clone(), in2.clone()])?;
        let act1 = Activation::build(&l4, ActivationFn::Sigmoid)?;
        let act2 = Activation::build(&l4, ActivationFn::HardSigmoid)?;
        let l5 = ToSparse::build(&act1, None)?;

        // in2 is reached from l4 without being listed
        let layers = layers_to_list(&[l5.clone(), act2], &[l3.clone()])?;
        assert_eq!(layers.len(), 6);
        assert_eq!(layers.first(), Some(&l3));
        assert_eq!(layers.last(), Some(&l5));
        assert!(layers.contains(&in2));
        assert!(!layers.contains(&l2));
        assert!(!layers.contains(&in1));

        let missing = Graph::build(&[l3.clone()], &[l5], false);
        assert!(matches!(missing, Err(GraphError::MissingInput(_))));
        Ok(())
    }

    #[test]
    fn test_append_layer() -> Result<(), Box<dyn Error>> {
        let x = input(2, "x")?;
        let y = Linear::builder(2).build(&x)?;
        let out1 = Activation::build(&y, ActivationFn::Softmax)?;
        let out2 = Activation::build(&out1, ActivationFn::Softmax)?;

        let graph = Graph::build(&[x.clone()], &[out1.clone(), out2.clone()], false)?;
        assert_eq!(graph.out_nodes(), &[out1.clone(), out2.clone()]);

        let mut graph = Graph::build(&[x.clone()], &[out1.clone()], false)?;
        assert!(!graph.out_nodes().contains(&out2));
        graph.append_layer(&out2)?;
        assert_eq!(graph.out_nodes(), &[out1, out2.clone()]);

        let other = Activation::build(&input(2, "other")?, ActivationFn::Relu)?;
        assert!(matches!(graph.append_layer(&other), Err(GraphError::NotInGraph(_))));
        Ok(())
    }

    #[test]
    fn test_compute() -> Result<(), Box<dyn Error>> {
        let x1 = input(2, "x1")?;
        let x2 = input(2, "x2")?;
        let sum = Add::build(&[x1.clone(), x2.clone()])?;
        let double = Lambda::builder(|inputs| Ok(Value::Dense(inputs[0].dense()?.mul_scalar(2.0))))
            .build(&[sum.clone()])?;
        let graph = Graph::build(&[x1.clone(), x2.clone()], &[double.clone(), sum.clone()], false)?;

        let mut feed = Feed::default();
        feed.insert(x1.clone(), Tensor::ones([1, 2]).into());
        feed.insert(x2.clone(), Tensor::full([1, 2], 2.0).into());
        let outputs = graph.compute(&feed)?;
        assert_eq!(outputs[0], Value::Dense(Tensor::full([1, 2], 6.0)));
        assert_eq!(outputs[1], Value::Dense(Tensor::full([1, 2], 3.0)));

        // a fed inner layer overrides its computation
        feed.insert(sum.clone(), Tensor::zeros([1, 2]).into());
        let outputs = graph.compute(&feed)?;
        assert_eq!(outputs[0], Value::Dense(Tensor::zeros([1, 2])));

        // fed inputs are validated
        feed.insert(x1.clone(), Tensor::ones([1, 3]).into());
        assert!(matches!(graph.compute(&feed), Err(GraphError::Layer(..))));

        // unfed inputs fall back to their stored value
        let feed = Feed::from_iter([(x1.clone(), Tensor::ones([1, 2]).into())]);
        assert!(graph.compute(&feed).is_err());
        x2.set_value(Tensor::ones([1, 2]))?;
        let outputs = graph.compute(&feed)?;
        assert_eq!(outputs[1], Value::Dense(Tensor::full([1, 2], 2.0)));

        // an inner in-node that is not fed is computed from its own inputs
        let graph = Graph::build(&[sum.clone()], &[double.clone()], false)?;
        x1.set_value(Tensor::ones([1, 2]))?;
        let outputs = graph.compute(&Feed::default())?;
        assert_eq!(outputs[0], Value::Dense(Tensor::full([1, 2], 4.0)));
        Ok(())
    }
}
