//! End-to-end scenarios driving the public [`TrainingHandle`] surface
//! across thread counts, stream shapes, and failure modes.

use crystalline::{train, TrainingConfig, TrainingError, TrainingHandle};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .try_init();
}

fn base_config() -> TrainingConfig {
    init_tracing();
    let mut cfg = TrainingConfig::default();
    cfg.vocab_size = 64;
    cfg.d_model = 16;
    cfg.n_heads = 4;
    cfg.d_ff = 32;
    cfg.n_layers = 2;
    cfg.max_seq_len = 16;
    cfg.batch_size = 4;
    cfg.seq_len = 8;
    cfg.epochs = 1;
    cfg.warmup_steps = 2;
    cfg.total_steps = 20;
    cfg.checkpoint_every_epochs = 0;
    cfg
}

fn token_stream(len: usize, vocab: u32) -> Vec<u32> {
    (0..len).map(|i| (i as u32 * 7 + 3) % vocab).collect()
}

#[test]
fn single_thread_smoke_runs_one_epoch_and_advances_the_model() {
    let mut cfg = base_config();
    cfg.num_threads = 1;
    let mut handle = train(cfg, token_stream(2000, 64)).unwrap();

    let before = handle.model().embedding.data.clone();
    let report = handle.step_epoch().unwrap();

    assert!(report.batches_processed > 0);
    assert!(!report.skipped);
    assert!(!report.cancelled);
    assert!(report.loss.is_finite());
    assert_ne!(before, handle.model().embedding.data);
}

#[test]
fn twelve_threads_spread_work_across_all_symmetry_groups() {
    let mut cfg = base_config();
    cfg.num_threads = 12;
    let mut handle = train(cfg, token_stream(6000, 64)).unwrap();

    let report = handle.step_epoch().unwrap();

    assert_eq!(report.per_sphere.len(), 12);
    let groups: std::collections::HashSet<u8> =
        report.per_sphere.iter().map(|s| s.sym_group).collect();
    assert_eq!(groups.len(), 12);
    let total: u64 = report.per_sphere.iter().map(|s| s.batches_processed).sum();
    assert_eq!(total, report.batches_processed);
}

#[test]
fn overworking_with_more_spheres_than_batches_still_covers_every_batch() {
    let mut cfg = base_config();
    cfg.num_threads = 63;
    let mut handle = train(cfg, token_stream(400, 64)).unwrap();

    let expected = {
        let cfg = handle.config().clone();
        let windows = 400usize.saturating_sub(1) / cfg.seq_len.max(1);
        windows / cfg.batch_size
    };
    let report = handle.step_epoch().unwrap();

    assert_eq!(report.batches_processed as usize, expected);
}

#[test]
fn empty_token_stream_yields_a_zero_batch_epoch_without_error() {
    let cfg = base_config();
    let mut handle = train(cfg, Vec::new()).unwrap();

    let before = handle.model().embedding.data.clone();
    let report = handle.step_epoch().unwrap();

    assert_eq!(report.batches_processed, 0);
    assert!(!report.skipped);
    assert_eq!(before, handle.model().embedding.data);
}

#[test]
fn cancelling_before_step_epoch_reports_cancelled_and_leaves_model_untouched() {
    let cfg = base_config();
    let mut handle = train(cfg, token_stream(4000, 64)).unwrap();
    handle.cancel();

    let before = handle.model().embedding.data.clone();
    let err = handle.step_epoch().unwrap_err();

    assert!(matches!(err, TrainingError::Cancelled));
    assert_eq!(before, handle.model().embedding.data);
    assert!(handle.is_cancelled());
}

#[test]
fn non_finite_parameters_cause_a_skipped_epoch_not_a_corrupted_one() {
    let cfg = base_config();
    // Poisoning the embedding table directly forces every forward pass to
    // produce non-finite logits, without needing to get unlucky with
    // random initialization to reach the same state.
    let mut model = crystalline::Model::new(&cfg).unwrap();
    model.embedding.data[0] = f32::NAN;
    let mut handle = TrainingHandle::from_model(cfg, token_stream(2000, 64), model).unwrap();

    let before = handle.model().embedding.data.clone();
    let report = handle.step_epoch().unwrap();

    assert!(report.skipped);
    assert_eq!(before, handle.model().embedding.data);
}

#[test]
fn fixed_seed_and_thread_count_reproduces_bitwise_identical_parameters() {
    // §8 property 3: two independent runs with the same `rng_seed` and the
    // same `num_threads` must land on bitwise-identical parameters after
    // each epoch. `num_threads = 1` removes scheduling order from the
    // picture entirely, isolating the guarantee the segmented accumulator
    // (`scheduler::gradient::GradientBuffer`) and the fixed Adam update
    // order are responsible for.
    let mut cfg = base_config();
    cfg.num_threads = 1;
    cfg.epochs = 2;
    cfg.rng_seed = 1234;

    let tokens_a = token_stream(2000, 64);
    let tokens_b = tokens_a.clone();

    let mut handle_a = train(cfg.clone(), tokens_a).unwrap();
    let mut handle_b = train(cfg, tokens_b).unwrap();

    let reports_a = handle_a.run().unwrap();
    let reports_b = handle_b.run().unwrap();

    assert_eq!(handle_a.model().embedding.data, handle_b.model().embedding.data);
    for (a, b) in reports_a.iter().zip(reports_b.iter()) {
        assert_eq!(a.loss, b.loss);
        assert_eq!(a.grad_norm, b.grad_norm);
    }
}

#[test]
fn running_multiple_epochs_keeps_reducing_loss_on_a_tiny_repeating_stream() {
    let mut cfg = base_config();
    cfg.epochs = 3;
    cfg.vocab_size = 16;
    cfg.d_model = 8;
    cfg.n_heads = 2;
    cfg.d_ff = 16;
    cfg.n_layers = 1;
    cfg.max_seq_len = 8;
    cfg.batch_size = 2;
    cfg.seq_len = 4;
    cfg.base_lr = 1e-2;
    cfg.warmup_steps = 0;
    cfg.total_steps = 3;

    let mut handle = train(cfg, token_stream(200, 16)).unwrap();
    let reports = handle.run().unwrap();

    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert!(!report.skipped);
        assert!(!report.cancelled);
    }
}
