use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use img_pdf_compressor::{
    FileIntakeHandler, HandlerConfig, ImageOptions, InputFile, IntakeState, View, MIB,
};

/// Image and PDF compressor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File to compress; `-` reads it from stdin
    input: Option<PathBuf>,

    /// Declared MIME type (guessed from the extension when omitted)
    #[arg(long)]
    mime: Option<String>,

    /// Directory the compressed file is written to
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Output size budget for images, in MB
    #[arg(long, default_value_t = 1.0)]
    max_size_mb: f64,

    /// Max image dimension (longer side)
    #[arg(long, default_value_t = 1024)]
    max_dim: u32,

    /// Compress on the main thread instead of a worker
    #[arg(long)]
    no_background: bool,

    /// Largest PDF accepted, in MB
    #[arg(long, default_value_t = 30)]
    pdf_limit_mb: u64,

    /// Accept PDFs of any size
    #[arg(long)]
    no_size_guard: bool,
}

impl Args {
    fn config(&self) -> HandlerConfig {
        HandlerConfig {
            image: ImageOptions {
                max_size_mb: self.max_size_mb,
                max_width_or_height: self.max_dim,
                use_background_thread: !self.no_background,
                ..ImageOptions::default()
            },
            pdf_size_limit: (!self.no_size_guard).then(|| self.pdf_limit_mb.saturating_mul(MIB)),
            pdf_in_background: !self.no_background,
            ..HandlerConfig::default()
        }
    }

    fn file(&self) -> Result<Option<InputFile>> {
        let Some(input) = &self.input else {
            return Ok(None);
        };
        let file = if input == Path::new("-") {
            InputFile::from_reader(std::io::stdin().lock(), self.mime.as_deref())
                .context("Failed to read stdin")?
        } else {
            let file = InputFile::from_path(input)
                .with_context(|| format!("Failed to open {:?}", input))?;
            match &self.mime {
                Some(mime) => file.with_mime_type(mime.as_str()),
                None => file,
            }
        };
        Ok(Some(file))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();

    let Some(file) = args.file()? else {
        println!("No file selected.");
        return Ok(ExitCode::SUCCESS);
    };
    println!("Loading {}: {} ({})", file.name(), file.mime_type(), megabytes(file.size()));

    let handler = FileIntakeHandler::new(args.config());
    let state = IntakeState::new();
    let start = Instant::now();
    if handler.handle(Some(&file), &state).await.is_none() {
        println!("Not an image or PDF, nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Processed in {:.2?}", start.elapsed());

    render(&state.view(), &args.out_dir, file.size())
}

fn render(view: &View, out_dir: &Path, original_size: u64) -> Result<ExitCode> {
    if let Some(link) = &view.link {
        let path = link
            .save_into(out_dir)
            .with_context(|| format!("Failed to write into {:?}", out_dir))?;
        println!("Download Compressed File: {}", path.display());
        println!("Original size: {}", megabytes(original_size));
        println!("New size:      {}", megabytes(link.len() as u64));
    }
    match &view.error {
        Some(message) => {
            eprintln!("{}", message);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

fn megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / MIB as f64)
}
