use clap::Parser;
use oci_image_builder::cli::{Args, dispatch, runner};
use oci_image_builder::logging::Logger;

#[tokio::main]
async fn main() {
    // A dispatch.json in the surrounding runfiles tree replaces the
    // command line entirely (self-contained push/load wrappers).
    let args = match runner::find_dispatch_file() {
        Some(path) => match dispatch::parse_dispatch_file(&path) {
            Ok(args) => args,
            Err(e) => {
                eprintln!("❌ ERROR: {}", e);
                std::process::exit(e.exit_code());
            }
        },
        None => match Args::try_parse() {
            Ok(args) => args,
            Err(e) => {
                use clap::error::ErrorKind;
                let code = match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                    // clap prints the usage banner; unknown subcommands
                    // and bad flags are usage errors.
                    _ => oci_image_builder::error::EXIT_VALIDATION,
                };
                let _ = e.print();
                std::process::exit(code);
            }
        },
    };

    let verbose = is_verbose(&args);
    let logger = Logger::new(verbose);
    if let Err(e) = runner::run(args, &logger).await {
        logger.error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}

fn is_verbose(args: &Args) -> bool {
    use oci_image_builder::cli::Commands::*;
    match &args.command {
        Some(Layer(a)) => a.verbose,
        Some(LayerMetadata(a)) => a.verbose,
        Some(Manifest(a)) => a.verbose,
        Some(Index(a)) => a.verbose,
        Some(Validate(a)) => a.verbose,
        Some(Pull(a)) => a.verbose,
        Some(Push(a)) => a.verbose,
        Some(PushMetadata(a)) => a.verbose,
        Some(Compress(a)) => a.verbose,
        Some(DownloadBlob(a)) => a.verbose,
        Some(OciLayout(a)) => a.verbose,
        Some(ExpandTemplate(a)) => a.verbose,
        Some(Load(a)) => a.verbose,
        Some(SyncOciRefGraph(a)) => a.verbose,
        Some(Hash(a)) => a.verbose,
        None => false,
    }
}
