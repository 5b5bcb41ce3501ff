use std::{
    error::Error,
    sync::{Arc, Mutex},
};

use tensorx::{
    activation::Activation as ActivationFn,
    graph::Feed,
    layers::{Activation, Input, Lambda, Layer, Linear, Value},
    loom::{num::DataType, tensor::Tensor},
    loss, random,
    train::{
        Batch, GradientOp, Model,
        callbacks::{
            At, Callback, CsvLogger, DecayAfter, EarlyStop, Eval, LambdaCallback, PlateauDecay,
            Progress, Trigger,
        },
        config::{OptimizerConfig, TrainConfig},
        optimizer::{Adadelta, Sgd},
    },
};

struct Classifier {
    inputs: Layer,
    labels: Layer,
    model: Model,
}

fn classifier() -> Result<Classifier, Box<dyn Error>> {
    let inputs = Input::builder(4).name("inputs").build()?;
    let linear = Linear::builder(2).name("classifier").build(&inputs)?;
    let h = Activation::build(&linear, ActivationFn::Sigmoid)?;

    let labels = Input::builder(2).name("labels").build()?;
    let losses = Lambda::builder(|inputs| {
        let labels = inputs[0].dense()?;
        let logits = inputs[1].dense()?;
        Ok(Value::Dense(loss::binary_cross_entropy(&labels, &logits)?))
    })
    .name("loss")
    .n_units(Some(1))
    .build(&[labels.clone(), linear])?;

    let model = Model::builder(&[inputs.clone()], &[h])
        .train(&[inputs.clone(), labels.clone()], &[losses.clone()])
        .eval(&[inputs.clone(), labels.clone()], &[losses])
        .build()?;
    Ok(Classifier {
        inputs,
        labels,
        model,
    })
}

/// Two examples per batch: `[1, 0, 1, 0]` labelled `[1, 0]` and `[0, 1, 0, 1]` labelled `[0, 1]`,
/// both with a little noise.
fn dataset(classifier: &Classifier, n: usize) -> Result<Vec<Batch>, Box<dyn Error>> {
    (0..n)
        .map(|i| -> Result<Batch, Box<dyn Error>> {
            let x = [1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]
                .into_iter()
                .map(|x| x + 0.1 * fastrand::f32())
                .collect::<Vec<f32>>();
            let x = Tensor::create([2, 4], x)?;
            let y = Tensor::create([2, 2], vec![1.0, 0.0, 0.0, 1.0])?;
            let batch = Batch::new([
                (classifier.inputs.clone(), x.into()),
                (classifier.labels.clone(), y.into()),
            ]);
            Ok(batch.property("prop1", i))
        })
        .collect()
}

#[test]
fn test_training_decreases_loss() -> Result<(), Box<dyn Error>> {
    random::seed(11);
    fastrand::seed(11);
    let mut classifier = classifier()?;
    let data = dataset(&classifier, 4)?;

    let optimizer = OptimizerConfig::Adam {
        lr: 0.1,
        beta1: 0.9,
        beta2: 0.999,
        epsilon: 1e-8,
    };
    classifier
        .model
        .config_boxed_optimizer(optimizer.build(), &[], Some(GradientOp::ClipGlobalNorm(5.0)));

    let weights = classifier.model.trainable_variables()[0].value();
    let before = classifier.model.eval_step(&data[0].feed)?;
    let context = classifier.model.train(&data, &TrainConfig::epochs(10), &mut [])?;
    let after = classifier.model.eval_step(&data[0].feed)?;

    assert!(after < before, "loss went from {before} to {after}");
    assert_ne!(classifier.model.trainable_variables()[0].value(), weights);
    assert_eq!(context.get_f32("epoch"), Some(10.0));
    assert_eq!(context.get_f32("step"), Some(40.0));
    assert_eq!(context.get_f32("prop1"), Some(3.0));
    assert!(context.get_f32("train_loss").is_some());
    Ok(())
}

#[test]
fn test_adadelta_updates_weights() -> Result<(), Box<dyn Error>> {
    random::seed(13);
    let mut classifier = classifier()?;
    classifier.model.config_optimizer(Adadelta::new(0.5), &[], None);

    let feed = Feed::from_iter([
        (classifier.inputs.clone(), Tensor::ones([1, 4]).into()),
        (classifier.labels.clone(), Tensor::create([1, 2], vec![1.0, 0.0])?.into()),
    ]);
    let weights = classifier.model.trainable_variables()[0].value();
    for _ in 0..10 {
        classifier.model.train_step(&feed)?;
    }
    assert_ne!(classifier.model.trainable_variables()[0].value(), weights);
    Ok(())
}

#[test]
fn test_checkpoint_round_trip() -> Result<(), Box<dyn Error>> {
    random::seed(17);
    let dir = tempfile::tempdir()?;
    let saved = classifier()?;
    let model = &saved.model;
    let feed = Feed::from_iter([(saved.inputs.clone(), Tensor::ones([1, 4]).into())]);
    let expected = model.run_step(&feed)?;

    for (r#type, name) in [(DataType::F32, "f32"), (DataType::F16, "f16")] {
        let path = dir.path().join(format!("{name}.safetensors"));
        model.save(&path, r#type)?;
        model.init_vars()?;
        assert_ne!(model.run_step(&feed)?, expected);

        model.load(&path)?;
        let loaded = model.run_step(&feed)?;
        let (Value::Dense(loaded), Value::Dense(expected)) = (&loaded[0], &expected[0]) else {
            return Err("dense outputs expected".into());
        };
        let tolerance = match r#type {
            DataType::F32 => 0.0,
            DataType::F16 => 1e-2,
        };
        for (x, y) in loaded.data().iter().zip(expected.data()) {
            assert!((x - y).abs() <= tolerance, "{x} != {y}");
        }
    }

    let other = classifier()?;
    let path = dir.path().join("other.safetensors");
    model.save(&path, DataType::F32)?;
    // variables of another model have other names
    assert!(other.model.load(&path).is_err());
    Ok(())
}

#[test]
fn test_callbacks() -> Result<(), Box<dyn Error>> {
    random::seed(19);
    fastrand::seed(19);
    let mut classifier = classifier()?;
    let data = dataset(&classifier, 2)?;
    let lr = 1.0;
    classifier.model.config_optimizer(Sgd::new(lr), &[], None);

    let steps = Arc::new(Mutex::new(vec![]));
    let recorded = steps.clone();
    let counter = LambdaCallback::new(&[Trigger::OnEveryStep(1, At::End)], move |context, _| {
        let step = context.get_f32("step").unwrap_or_default() as usize;
        recorded.lock().expect("failed to lock").push(step);
        Ok(())
    });

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.csv");
    let logger = CsvLogger::new(
        &path,
        &["epoch", "step", "lr", "prop1", "validation_ppl"],
        Trigger::OnEveryEpoch(1, At::End),
    )
    .static_log("id", 0usize);

    let mut callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(Progress::new(Some(6 * 2), &["last_loss", "train_loss"])),
        Box::new(
            Eval::new("validation_ppl", data.clone(), Trigger::OnEveryEpoch(1, At::End))
                .transform(f32::exp),
        ),
        Box::new(logger),
        Box::new(DecayAfter::new(2, 0.5, "lr")),
        Box::new(counter),
    ];
    let context = classifier
        .model
        .train(&data, &TrainConfig::epochs(6), &mut callbacks)?;

    assert_eq!(*steps.lock().expect("failed to lock"), (1..=12).collect::<Vec<_>>());
    // decayed at the end of epochs 2 to 6
    let decayed = lr * 0.5f32.powi(5);
    assert_eq!(context.get_f32("lr"), Some(decayed));
    assert_eq!(classifier.model.params()[0].get(), decayed);
    assert!(context.get_f32("validation_ppl").is_some_and(|ppl| ppl >= 1.0));

    let csv = std::fs::read_to_string(&path)?;
    let lines = csv.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[0], "id,epoch,step,lr,prop1,validation_ppl");
    assert!(lines[1].starts_with("0,1,2,1,1,"));
    Ok(())
}

#[test]
fn test_early_stop() -> Result<(), Box<dyn Error>> {
    random::seed(23);
    fastrand::seed(23);
    let mut classifier = classifier()?;
    let data = dataset(&classifier, 2)?;
    // a zero learning rate never improves the loss
    classifier.model.config_optimizer(Sgd::new(0.0), &[], None);

    let mut callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(Eval::new("score", data.clone(), Trigger::OnEveryEpoch(1, At::End))),
        Box::new(EarlyStop::new(2, "score", 1e-3, true)),
        Box::new(PlateauDecay::new("score", "lr", 1e-3, 0.5)),
    ];
    let context = classifier
        .model
        .train(&data, &TrainConfig::epochs(10), &mut callbacks)?;

    // the first epoch sets the best score, two more without improvement stop the loop
    assert_eq!(context.get_f32("epoch"), Some(3.0));
    assert_eq!(context.get_f32("lr"), Some(0.0));
    Ok(())
}
