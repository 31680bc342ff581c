use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vits_modeling::HostPlatform;
use vits_train::{
    BootstrapError, Orchestrator, Preflight, ProcessGroupBootstrap, RunOptions, TrainArgs,
};

async fn async_main() -> Result<()> {
    let args = TrainArgs::parse();

    let hparams = match args.preflight(HostPlatform::current())? {
        Preflight::Ready(hparams) => hparams,
        Preflight::Unsupported(platform) => {
            vits_train::logging()
                .with_output(args.log_output)
                .with_level(args.log_level)
                .init()?;
            error!("{}", BootstrapError::PlatformUnsupported(platform));
            return Ok(());
        }
    };
    vits_train::logging()
        .with_output(args.log_output)
        .with_level(args.log_level)
        .with_log_file(args.log_file())
        .init()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current epoch");
                cancel.cancel();
            }
        }
    });

    let bootstrap = ProcessGroupBootstrap::new(&args.device, hparams.train.seed)
        .with_rendezvous(args.rendezvous.clone());
    info!(
        devices = %args.device,
        world_size = bootstrap.world_size(),
        model_dir = %args.model_dir.display(),
        "============ Training startup ============"
    );

    let options = RunOptions {
        model_dir: args.model_dir.clone(),
        on_corrupt_checkpoint: args.on_corrupt_checkpoint,
        prefetch: args.prefetch,
    };
    let orchestrator = Orchestrator::new(hparams, options, cancel);
    let result = tokio::task::spawn_blocking(move || {
        bootstrap.launch(move |worker| orchestrator.run(worker))
    })
    .await?;

    match result {
        Ok(ends) => {
            if let Some(end) = ends.first() {
                info!(
                    epoch = end.epoch,
                    global_step = end.global_step,
                    "Training finished"
                );
            }
            Ok(())
        }
        Err(err @ BootstrapError::PlatformUnsupported(_)) => {
            error!("{err}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn main() -> Result<()> {
    vits_train::runtime()?.block_on(async_main())
}
