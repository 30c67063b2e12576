use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use tracing::info;
use unet_rust::{
    sample::{read_vol, write_vol, SampleFormat},
    visualize, RunConfig, UnetError, Vol,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("unet failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "U-Net segmentation training and inference", long_about = None)]
struct Args {
    #[arg(short, long, global = true, help = "Log debug output")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a network and write one checkpoint per epoch
    Train {
        #[arg(short, long, value_name = "PATH", help = "Path to the JSON run config")]
        config: PathBuf,
    },
    /// Segment one image with the newest checkpoint
    Predict {
        #[arg(short, long, value_name = "PATH", help = "Path to the JSON run config")]
        config: PathBuf,

        #[arg(
            short,
            long,
            value_name = "PATH",
            help = "Grayscale image, or a volume stored as .json/.bin"
        )]
        image: PathBuf,

        #[arg(short, long, value_name = "DIR", help = "Directory for the class maps")]
        output: PathBuf,
    },
}

fn run() -> Result<(), UnetError> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match args.command {
        Command::Train { config } => train(config),
        Command::Predict {
            config,
            image,
            output,
        } => predict(config, image, output),
    }
}

fn train(config: PathBuf) -> Result<(), UnetError> {
    let config = RunConfig::load(&config)?;
    let unet = config.build_model()?;
    let mut trainer = config.build_trainer(&unet)?;

    let path = trainer.train(
        &config.output_path,
        &config.train_source(),
        &config.verification_source(),
        &config.train_options(),
    )?;
    println!("final checkpoint: {}", path.display());
    Ok(())
}

fn load_image(path: &Path) -> Result<Vol, UnetError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => read_vol(path, SampleFormat::Json),
        Some("bin") => read_vol(path, SampleFormat::Bincode),
        _ => {
            let img = image::open(path)?.to_luma8();
            let (width, height) = img.dimensions();
            Vol::from_grayscale_image(img.as_raw(), width, height)
        }
    }
}

fn predict(config: PathBuf, image: PathBuf, output: PathBuf) -> Result<(), UnetError> {
    let config = RunConfig::load(&config)?;
    let unet = config.build_model()?;

    let input = load_image(&image)?;
    info!(
        "Predicting {} ({}), output {}",
        image.display(),
        input.shape(),
        unet.output_shape(input.sx(), input.sy())?
    );
    let prediction = unet.predict(&input)?;

    fs::create_dir_all(&output)?;
    let tag = image
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prediction".to_string());

    for path in visualize::save_prediction_images(&output, &tag, &prediction)? {
        println!("{}", path.display());
    }
    let probabilities = output.join(format!("{tag}_probabilities.json"));
    write_vol(&probabilities, &prediction, SampleFormat::Json)?;
    println!("{}", probabilities.display());
    Ok(())
}
