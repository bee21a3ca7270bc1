use ndarray::{Array1, s};
use rand::{SeedableRng, rngs::StdRng};

use tokens_encoder::{
    EncoderErr,
    arch::{EmbeddingsMap, Initializer, KeyExtractor, Module, layers::DenseParams},
    config::{ComponentSpec, EncoderSpec, MergeSpec, ModelBuilder},
    encoders::{
        Component, EmbeddingsModel, EncoderModel, EncoderOptions, EncodersPool, EnsembleModel,
        InputErrors, MergeModel, ParamsErrors,
    },
    optimization::UpdateMethod,
    sentence::{Sentence, Token},
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn corpus() -> Vec<Sentence> {
    vec![
        Sentence::new([
            Token::with_features("The", ["p:det"]),
            Token::with_features("cats", ["p:noun", "n:pl"]),
            Token::with_features("slept", ["p:verb", "t:past"]),
        ]),
        Sentence::from_forms(["a", "dog", "barked", "in", "1999"]),
    ]
}

fn embeddings(width: usize, seed: u64) -> EncoderModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let keys = ["a", "b"].map(String::from);
    let embeddings = EmbeddingsMap::new(width, keys, &Initializer::default(), &mut rng).unwrap();
    EmbeddingsModel::new(embeddings, KeyExtractor::Form).into()
}

fn ramp(start: usize, end: usize) -> Array1<f32> {
    (start..end).map(|x| x as f32).collect()
}

fn leaf_specs() -> Vec<EncoderSpec> {
    let words = EncoderSpec::Embeddings {
        width: 4,
        extractor: KeyExtractor::Normalized,
        fallbacks: vec![KeyExtractor::Lowercase],
        dropout: 0.,
        frequency_dropout: false,
    };

    vec![
        words.clone(),
        EncoderSpec::CharsBiRnn {
            char_width: 3,
            hidden: 2,
        },
        EncoderSpec::CharsAttention {
            char_width: 3,
            attention: 4,
            output: 5,
        },
        EncoderSpec::Transformer {
            width: 4,
            extractor: KeyExtractor::Form,
            fine_tuning: true,
        },
        EncoderSpec::Morpho {
            output: 3,
            act_fn: None,
        },
        EncoderSpec::Reduction {
            input: Box::new(words),
            output: 2,
            act_fn: None,
            optimize_input: true,
        },
    ]
}

fn all_specs() -> Vec<EncoderSpec> {
    let mut specs = leaf_specs();
    let components = leaf_specs()
        .into_iter()
        .map(|encoder| ComponentSpec {
            encoder,
            trainable: true,
        })
        .collect();

    specs.push(EncoderSpec::Ensemble {
        components,
        merge: MergeSpec::Concat,
    });
    specs
}

#[test]
fn every_encoder_yields_one_vector_per_token() {
    init_logging();
    let corpus = corpus();
    let sentence = Sentence::from_forms(["The", "unseen", "dog", "slept"]);

    for spec in all_specs() {
        let model = ModelBuilder::new(&corpus, Some(11)).build(&spec).unwrap();
        let mut encoder = model.build_encoder(0, EncoderOptions::default()).unwrap();

        let output = encoder.forward(&model, &sentence).unwrap();
        assert_eq!(output.len(), sentence.len(), "{model}");
        assert!(
            output.iter().all(|o| o.len() == model.encoding_size()),
            "{model}"
        );
    }
}

#[test]
fn propagating_encoders_yield_one_input_error_per_token() {
    init_logging();
    let corpus = corpus();
    let sentence = Sentence::from_forms(["a", "dog", "a"]);
    let options = EncoderOptions::default().with_propagate_to_input(true);

    for spec in all_specs() {
        let model = ModelBuilder::new(&corpus, Some(5)).build(&spec).unwrap();
        let mut encoder = model.build_encoder(0, options).unwrap();

        let output = encoder.forward(&model, &sentence).unwrap();
        let errors: Vec<_> = output.iter().map(|o| Array1::ones(o.len())).collect();
        encoder.backward(&model, &errors).unwrap();

        match encoder.input_errors(false).unwrap() {
            InputErrors::Tokens(errors) => assert_eq!(errors.len(), sentence.len(), "{model}"),
            InputErrors::NoInputErrors => assert!(
                matches!(model, EncoderModel::CharsBiRnn(_) | EncoderModel::CharsAttention(_)),
                "{model}"
            ),
        }
    }
}

#[test]
fn concatenation_preserves_each_branch_output() {
    let corpus = corpus();
    let spec = EncoderSpec::Ensemble {
        components: vec![
            ComponentSpec {
                encoder: EncoderSpec::Embeddings {
                    width: 3,
                    extractor: KeyExtractor::Form,
                    fallbacks: Vec::new(),
                    dropout: 0.,
                    frequency_dropout: false,
                },
                trainable: true,
            },
            ComponentSpec {
                encoder: EncoderSpec::CharsAttention {
                    char_width: 2,
                    attention: 3,
                    output: 5,
                },
                trainable: true,
            },
            ComponentSpec {
                encoder: EncoderSpec::Morpho {
                    output: 2,
                    act_fn: None,
                },
                trainable: false,
            },
        ],
        merge: MergeSpec::Concat,
    };

    let model = ModelBuilder::new(&corpus, Some(3)).build(&spec).unwrap();
    let EncoderModel::Ensemble(ensemble) = &model else {
        panic!("expected an ensemble, got {model}");
    };

    let sentence = Sentence::new([Token::with_features("cats", ["p:noun"])]);
    let mut encoder = model.build_encoder(0, EncoderOptions::default()).unwrap();
    let merged = encoder.forward(&model, &sentence).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].len(), 10);

    let bounds = [(0, 3), (3, 8), (8, 10)];
    for (component, (start, end)) in ensemble.components().iter().zip(bounds) {
        let mut branch = component
            .model
            .build_encoder(0, EncoderOptions::default())
            .unwrap();
        let own = branch.forward(&component.model, &sentence).unwrap();

        assert_eq!(merged[0].slice(s![start..end]), own[0]);
    }
}

#[test]
fn concatenation_splits_the_errors_between_branches() {
    let model: EncoderModel =
        EnsembleModel::concat(vec![embeddings(3, 0), embeddings(5, 1), embeddings(2, 2)])
            .unwrap()
            .into();

    let mut encoder = model.build_encoder(0, EncoderOptions::default()).unwrap();
    encoder.forward(&model, &Sentence::from_forms(["a"])).unwrap();
    encoder.backward(&model, &[ramp(0, 10)]).unwrap();

    let ParamsErrors::Ensemble(errors) = encoder.params_errors(false).unwrap() else {
        panic!("expected ensemble errors");
    };

    let received: Vec<_> = errors
        .branches
        .into_iter()
        .map(|branch| match branch {
            Some(ParamsErrors::Embeddings(rows)) => rows,
            other => panic!("unexpected branch errors {other:?}"),
        })
        .collect();

    assert_eq!(
        received,
        [
            vec![(1, vec![0., 1., 2.])],
            vec![(1, vec![3., 4., 5., 6., 7.])],
            vec![(1, vec![8., 9.])],
        ]
    );
}

#[test]
fn frozen_branches_never_reach_the_optimizer() {
    init_logging();
    let components = vec![
        Component::trainable(embeddings(2, 0)),
        Component::frozen(embeddings(2, 1)),
    ];
    let mut model: EncoderModel = EnsembleModel::new(components, MergeModel::Sum)
        .unwrap()
        .into();
    let before = model.clone();

    // the frozen branch is still backwarded to propagate the errors further upstream
    let options = EncoderOptions::default().with_propagate_to_input(true);
    let mut encoder = model.build_encoder(0, options).unwrap();
    encoder.forward(&model, &Sentence::from_forms(["b"])).unwrap();
    encoder.backward(&model, &[ramp(1, 3)]).unwrap();

    let input_errors = encoder.input_errors(true).unwrap();
    assert_eq!(
        input_errors.tokens().unwrap(),
        [Array1::from(vec![1f32, 2., 1., 2.])]
    );

    let errors = encoder.params_errors(false).unwrap();
    let ParamsErrors::Ensemble(ensemble_errors) = &errors else {
        panic!("expected ensemble errors");
    };
    assert!(ensemble_errors.branches[0].is_some());
    assert!(ensemble_errors.branches[1].is_none());

    let method = UpdateMethod::GradientDescent { learning_rate: 1. };
    let mut optimizer = model.build_optimizer(&method).unwrap();
    optimizer.accumulate(&errors).unwrap();
    optimizer.update(&mut model).unwrap();

    let (EncoderModel::Ensemble(after), EncoderModel::Ensemble(before)) = (&model, &before) else {
        unreachable!()
    };
    assert_ne!(after.components()[0], before.components()[0]);
    assert_eq!(after.components()[1], before.components()[1]);
}

#[test]
fn pooled_encoders_are_reused_in_order_without_stale_values() {
    init_logging();
    let model = embeddings(3, 4);
    let mut pool = EncodersPool::new(EncoderOptions::default());

    let first = Sentence::from_forms(["a", "a", "b"]);
    let second = Sentence::from_forms(["b"]);

    let ids: Vec<_> = pool
        .get_encoders(&model, 3)
        .unwrap()
        .iter_mut()
        .map(|encoder| {
            encoder.forward(&model, &first).unwrap();
            encoder.id()
        })
        .collect();
    assert_eq!(ids, [0, 1, 2]);

    let mut fresh = model.build_encoder(9, EncoderOptions::default()).unwrap();
    let expected = fresh.forward(&model, &second).unwrap();

    let encoders = pool.get_encoders(&model, 3).unwrap();
    for (i, encoder) in encoders.iter_mut().enumerate() {
        assert_eq!(encoder.id(), i);
        assert_eq!(encoder.forward(&model, &second).unwrap(), expected);
    }

    assert_eq!(pool.size(), 3);
    assert_eq!(pool.issued(), 3);
}

#[test]
fn pooled_ensembles_draw_their_own_dropout_masks() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(7);
    let table = EmbeddingsMap::new(4, ["a".to_string()], &Initializer::default(), &mut rng).unwrap();
    let words = EmbeddingsModel::new(table, KeyExtractor::Form)
        .with_dropout(0.5, None)
        .unwrap();
    let model: EncoderModel = EnsembleModel::concat(vec![words.into()]).unwrap().into();

    let sentence = Sentence::from_forms(vec!["a"; 64]);
    let options = EncoderOptions::training().with_seed(42);

    let mut pool = EncodersPool::new(options);
    let outputs: Vec<_> = pool
        .get_encoders(&model, 2)
        .unwrap()
        .iter_mut()
        .map(|encoder| encoder.forward(&model, &sentence).unwrap())
        .collect();
    assert_ne!(outputs[0], outputs[1]);

    let mut replayed = EncodersPool::new(options);
    let (_, encoder) = replayed.get_item(&model).unwrap();
    assert_eq!(encoder.forward(&model, &sentence).unwrap(), outputs[0]);
}

#[test]
fn pools_only_serve_the_model_they_were_filled_with() {
    let model = embeddings(3, 0);
    let mut pool = EncodersPool::new(EncoderOptions::default());
    pool.get_encoders(&model, 2).unwrap();

    assert!(pool.get_item(&embeddings(3, 1)).is_ok());
    assert!(matches!(
        pool.get_item(&embeddings(4, 0)),
        Err(EncoderErr::WidthMismatch { got: 4, expected: 3, .. })
    ));

    let ensemble: EncoderModel = EnsembleModel::concat(vec![embeddings(3, 0)]).unwrap().into();
    assert!(matches!(
        pool.get_encoders(&ensemble, 1),
        Err(EncoderErr::ModelMismatch { expected: "embeddings", got: "ensemble" })
    ));

    pool.release_all();
    pool.shrink_to(0).unwrap();
    assert_eq!(pool.get_encoders(&ensemble, 1).unwrap().len(), 1);
}

#[test]
fn released_encoders_must_be_forwarded_again() {
    let model = embeddings(2, 0);
    let mut pool = EncodersPool::new(EncoderOptions::default());

    let (id, encoder) = pool.get_item(&model).unwrap();
    assert_eq!(id, 0);
    encoder.forward(&model, &Sentence::from_forms(["a"])).unwrap();

    pool.release_all();
    let (id, encoder) = pool.get_item(&model).unwrap();
    assert_eq!(id, 0);

    assert!(matches!(
        encoder.backward(&model, &[ramp(0, 2)]),
        Err(EncoderErr::StaleState { id: 0, .. })
    ));

    assert!(matches!(
        pool.shrink_to(0),
        Err(EncoderErr::PoolShrinkBelowIssued { issued: 1, requested: 0 })
    ));
}

#[test]
fn invalid_ensembles_fail_at_construction() {
    assert!(matches!(
        EnsembleModel::new(Vec::new(), MergeModel::Concat),
        Err(EncoderErr::EmptyEnsemble)
    ));

    let branches = || {
        vec![
            Component::trainable(embeddings(3, 0)),
            Component::trainable(embeddings(5, 1)),
        ]
    };

    for merge in [MergeModel::Sum, MergeModel::Avg, MergeModel::Product] {
        assert!(matches!(
            EnsembleModel::new(branches(), merge),
            Err(EncoderErr::WidthMismatch { got: 5, expected: 3, .. })
        ));
    }

    let mut rng = StdRng::seed_from_u64(0);
    let dense = DenseParams::new(vec![3, 2], 4, None, &Initializer::default(), &mut rng).unwrap();
    assert!(matches!(
        EnsembleModel::new(branches(), MergeModel::Affine(dense)),
        Err(EncoderErr::WidthMismatch { got: 5, expected: 2, .. })
    ));
}

#[test]
fn models_survive_a_save_and_load() {
    let corpus = corpus();
    let spec = EncoderSpec::Ensemble {
        components: all_specs()
            .into_iter()
            .take(5)
            .map(|encoder| ComponentSpec {
                encoder,
                trainable: true,
            })
            .collect(),
        merge: MergeSpec::ConcatFeedforward {
            output: 6,
            act_fn: None,
        },
    };
    let model = ModelBuilder::new(&corpus, Some(8)).build(&spec).unwrap();

    let path = std::env::temp_dir().join(format!("tokens_encoder_{}.json", std::process::id()));
    model.save(&path).unwrap();
    let loaded = EncoderModel::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded, model);
    assert_eq!(loaded.to_string(), "ensemble encoder, encoding size 6");
}
