//! Train a quantizer on synthetic clustered data with codebook merging.
//!
//! Run with: RUST_LOG=info cargo run --release --example curriculum

use multi_kmeans::{AdamConfig, CurriculumTrainer, Quantizer, SyntheticSource, TrainerConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

fn main() -> multi_kmeans::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dim = 32;
    let mut rng = StdRng::seed_from_u64(0);
    let mut source = SyntheticSource::new(dim, 64, 0.05, 1)?;

    // 8 codebooks of 4 centers -> 4 of 16 -> 2 of 256
    let mut quantizer = Quantizer::with_rng(dim, 4, 8, &mut rng)?;
    println!(
        "Initial: {} codebooks x {} centers ({} bits per vector)",
        quantizer.num_codebooks(),
        quantizer.codebook_size(),
        quantizer.bank().bits_per_code()
    );

    let config = TrainerConfig::default()
        .with_batch_size(256)
        .with_steps_per_stage(500)
        .with_num_stages(3)
        .with_log_every(100)
        .with_adam(AdamConfig::default().with_lr(5e-3));
    let trainer = CurriculumTrainer::new(config)?;
    let report = trainer.run(&mut quantizer, &mut source, &mut rng)?;

    println!("\n=== Stages ===\n");
    for stage in &report.stages {
        println!(
            "stage {}: {}x{} ref_loss={:.4} frame_entropy={:.3} (target {:.3})",
            stage.stage,
            stage.num_codebooks,
            stage.codebook_size,
            stage.ref_loss,
            stage.frame_entropy,
            stage.target_frame_entropy
        );
    }

    let holdout = source.generate(2000)?;
    let codes = quantizer.encode(&holdout, 4)?;
    println!(
        "\nHoldout relative error: {:.4}",
        quantizer.relative_error(&holdout, &codes)?
    );
    Ok(())
}
