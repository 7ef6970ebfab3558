use anyhow::{bail, Context as _, Error};
use misc_utils::fs;
use pktmask::{MaskConfig, MaskPayloadStage, Mode, NormalizedConfig};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(global_settings(&[
    structopt::clap::AppSettings::ColoredHelp,
    // Print help, if no arguments are given
    structopt::clap::AppSettings::ArgRequiredElseHelp
]))]
struct CliArgs {
    /// List of PCAP files to mask
    #[structopt(name = "PCAPS")]
    pcap_files: Vec<PathBuf>,
    /// Directory for the masked copies
    ///
    /// Defaults to the directory of each input file.
    #[structopt(short = "o", long = "output-dir")]
    output_dir: Option<PathBuf>,
    /// Suffix appended to the file stem of each masked copy
    #[structopt(long = "suffix", default_value = "-masked")]
    suffix: String,
    /// JSON configuration file in the canonical stage shape
    #[structopt(short = "c", long = "config")]
    config: Option<PathBuf>,
    /// Processing mode: enhanced, basic or debug
    #[structopt(long = "mode")]
    mode: Option<Mode>,
    /// Keep whole ApplicationData records instead of only their 5-byte headers
    #[structopt(long = "preserve-application-data")]
    preserve_application_data: bool,
    /// Mask Handshake record bodies instead of keeping them
    #[structopt(long = "mask-handshake")]
    mask_handshake: bool,
    /// Mask Alert record bodies instead of keeping them
    #[structopt(long = "mask-alert")]
    mask_alert: bool,
    /// Mask ChangeCipherSpec record bodies instead of keeping them
    #[structopt(long = "mask-change-cipher-spec")]
    mask_change_cipher_spec: bool,
    /// Mask Heartbeat record bodies instead of keeping them
    #[structopt(long = "mask-heartbeat")]
    mask_heartbeat: bool,
    /// Path to the tshark executable
    #[structopt(long = "tshark-path")]
    tshark_path: Option<PathBuf>,
    /// Extra `port,protocol` decode hints for the dissector
    #[structopt(short = "d", long = "decode-as", number_of_values = 1)]
    decode_as: Vec<String>,
    /// Print the full statistics record for each file as JSON
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

fn main() -> Result<(), Error> {
    // generic setup
    env_logger::init();
    let cli_args = CliArgs::from_args();

    let mut config = load_config(cli_args.config.as_deref())?;
    if let Some(mode) = cli_args.mode {
        config.mode = mode;
    }
    if cli_args.preserve_application_data {
        config.marker_config.preserve.application_data = true;
    }
    if cli_args.mask_handshake {
        config.marker_config.preserve.handshake = false;
    }
    if cli_args.mask_alert {
        config.marker_config.preserve.alert = false;
    }
    if cli_args.mask_change_cipher_spec {
        config.marker_config.preserve.change_cipher_spec = false;
    }
    if cli_args.mask_heartbeat {
        config.marker_config.preserve.heartbeat = false;
    }
    if let Some(tshark_path) = &cli_args.tshark_path {
        config.marker_config.tshark_path = Some(tshark_path.clone());
    }
    config
        .marker_config
        .decode_as
        .extend(cli_args.decode_as.iter().cloned());

    let stage = MaskPayloadStage::new(config)?;

    for file in &cli_args.pcap_files {
        let output = output_path(file, cli_args.output_dir.as_deref(), &cli_args.suffix)?;
        let stats = stage
            .process_file(file, &output)
            .with_context(|| format!("failed processing {}", file.display()))?;

        if cli_args.verbose {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!(
                "{}: {} packets, {} modified, {} bytes masked, {} preserved -> {}",
                file.display(),
                stats.packets_processed,
                stats.packets_modified,
                stats.extra_metrics.masked_bytes,
                stats.extra_metrics.preserved_bytes,
                output.display(),
            );
        }
        for warning in &stats.extra_metrics.warnings {
            eprintln!("warning: {}", warning);
        }
        for error in &stats.extra_metrics.errors {
            eprintln!("error: {}", error);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MaskConfig, Error> {
    match path {
        Some(path) => {
            let raw = fs::read(path)
                .map_err(|err| anyhow::anyhow!("cannot read config {}: {}", path.display(), err))?;
            let value = serde_json::from_slice(&raw)
                .with_context(|| format!("config {} is not valid JSON", path.display()))?;
            let NormalizedConfig { config, warnings } = MaskConfig::from_value(&value)?;
            for warning in warnings {
                eprintln!("warning: {}", warning);
            }
            Ok(config)
        }
        None => Ok(MaskConfig::default()),
    }
}

fn output_path(input: &Path, output_dir: Option<&Path>, suffix: &str) -> Result<PathBuf, Error> {
    let stem = match input.file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => bail!("input path {} has no file name", input.display()),
    };
    let extension = input
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let file_name = format!("{}{}{}", stem, suffix, extension);

    let directory = match output_dir {
        Some(directory) => directory.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok(directory.join(file_name))
}
