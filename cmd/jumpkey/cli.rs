use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use clap::{Parser as ClapParser, Subcommand as ClapSubcommand};
use jumpkey::{JumpLabels, KeyId, PatchConfig, PokeMode, Site, SiteEncoding};
use serde::Serialize;
use tracing::{Level, info, warn};

use crate::initializers::{build_image, load_labels};

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "jumpkey", author, version = VERSION_STRING, about = "Build, inspect and exercise jump-label images", long_about = None)]
pub struct CLI {
    #[clap(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser)]
pub struct Options {
    #[arg(long = "log.level", default_value_t = Level::INFO, value_name = "LOG_LEVEL")]
    pub log_level: Level,
    #[arg(
        long = "encoding",
        default_value_t = SiteEncoding::DEFAULT.as_str().to_owned(),
        value_name = "ENCODING",
        env = "JUMPKEY_ENCODING",
        help = "Site encoding: `placeholder` or `direct-transfer`"
    )]
    pub encoding: String,
    #[arg(long = "keys", default_value_t = 4, value_name = "COUNT", help_heading = "Image options")]
    pub keys: u32,
    #[arg(
        long = "sites-per-key",
        default_value_t = 8,
        value_name = "COUNT",
        help_heading = "Image options"
    )]
    pub sites_per_key: usize,
    #[arg(
        long = "poke-mode",
        value_name = "MODE",
        env = "JUMP_LABEL_POKE_MODE",
        help_heading = "Patch options"
    )]
    pub poke_mode: Option<String>,
    #[arg(
        long = "barrier.timeout-ms",
        value_name = "MILLISECONDS",
        env = "JUMP_LABEL_BARRIER_TIMEOUT_MS",
        help_heading = "Patch options"
    )]
    pub barrier_timeout_ms: Option<u64>,
    #[arg(
        long = "barrier.retries",
        value_name = "COUNT",
        env = "JUMP_LABEL_BARRIER_RETRIES",
        help_heading = "Patch options"
    )]
    pub barrier_retries: Option<u32>,
}

impl Options {
    pub fn encoding(&self) -> eyre::Result<SiteEncoding> {
        self.encoding.parse().map_err(|e: String| eyre::eyre!(e))
    }

    /// Patch configuration from the environment, with flags taking precedence.
    pub fn patch_config(&self) -> eyre::Result<PatchConfig> {
        let mut config = PatchConfig::from_env()?;
        if let Some(mode) = &self.poke_mode {
            config.poke_mode = mode.parse::<PokeMode>().map_err(|e| eyre::eyre!(e))?;
        }
        if let Some(timeout) = self.barrier_timeout_ms {
            config.barrier_timeout_ms = timeout;
        }
        if let Some(retries) = self.barrier_retries {
            config.barrier_retries = retries;
        }
        Ok(config)
    }
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[clap(name = "dump", about = "Print the jump table of a synthetic image as JSON")]
    Dump {
        #[clap(
            long = "enable",
            value_name = "KEY",
            value_delimiter = ',',
            num_args = 1..,
            help = "Keys to enable before dumping"
        )]
        enable: Vec<u32>,
    },
    #[clap(name = "verify", about = "Toggle every key on and off and check every site")]
    Verify,
    #[clap(name = "stress", about = "Toggle keys while reader threads evaluate every site")]
    Stress {
        #[clap(long = "readers", default_value_t = 8, value_name = "COUNT")]
        readers: usize,
        #[clap(long = "rounds", default_value_t = 1000, value_name = "COUNT")]
        rounds: usize,
    },
}

#[derive(Serialize)]
struct DumpedSite {
    index: usize,
    code: String,
    target: String,
    key: KeyId,
    polarity: jumpkey::Polarity,
    enabled: bool,
    insn: String,
}

impl Subcommand {
    pub fn run(self, opts: &Options) -> eyre::Result<()> {
        let image = build_image(opts)?;
        let labels = load_labels(image, opts)?;

        match self {
            Subcommand::Dump { enable } => {
                for key in enable {
                    labels.enable(KeyId(key))?;
                }
                let sites: Vec<DumpedSite> = (0..labels.entries().len())
                    .filter_map(|index| labels.site(index))
                    .map(|site| dump_site(&labels, site))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&sites)?);
            }
            Subcommand::Verify => {
                let keys = key_ids(&labels);
                let mut problems = labels.verify().len();
                for &key in &keys {
                    if labels.is_enabled(key) {
                        labels.disable(key)?;
                        problems += labels.verify().len();
                        labels.enable(key)?;
                    } else {
                        labels.enable(key)?;
                        problems += labels.verify().len();
                        labels.disable(key)?;
                    }
                }
                problems += labels.verify().len();
                if problems > 0 {
                    eyre::bail!("{problems} site(s) do not match their key");
                }
                info!(keys = keys.len(), sites = labels.entries().len(), "All sites verified");
            }
            Subcommand::Stress { readers, rounds } => {
                stress(&labels, readers, rounds)?;
            }
        }
        Ok(())
    }
}

fn key_ids(labels: &JumpLabels) -> Vec<KeyId> {
    (0..labels.num_keys())
        .filter_map(|i| u32::try_from(i).ok())
        .map(KeyId)
        .collect()
}

fn dump_site(labels: &JumpLabels, site: Site) -> DumpedSite {
    let size = labels.entry_size(site.code()).unwrap_or(0);
    let bytes = labels.text_bytes(site.code(), size).unwrap_or_default();
    DumpedSite {
        index: site.index(),
        code: format!("{:#x}", site.code()),
        target: format!("{:#x}", site.target()),
        key: site.key(),
        polarity: site.polarity(),
        enabled: labels.is_enabled(site.key()),
        insn: hex::encode(bytes),
    }
}

/// Flip every key on and off `rounds` times, one batch per round.
fn toggle_rounds(labels: &JumpLabels, keys: &[KeyId], rounds: usize) -> eyre::Result<()> {
    for round in 0..rounds {
        let mut batch = labels.batch();
        for &key in keys {
            batch.set(key, round % 2 == 0);
        }
        let report = batch.commit();
        if let Some((key, err)) = report.failed.into_iter().next() {
            eyre::bail!("round {round}: key {key}: {err}");
        }
    }
    Ok(())
}

fn stress(labels: &JumpLabels, readers: usize, rounds: usize) -> eyre::Result<()> {
    let keys = key_ids(labels);
    let done = AtomicBool::new(false);
    let started = Instant::now();

    let toggled: eyre::Result<()> = thread::scope(|s| {
        for _ in 0..readers {
            s.spawn(|| {
                let ctx = labels.register_context();
                let sites: Vec<Site> = (0..labels.entries().len())
                    .filter_map(|index| labels.site(index))
                    .collect();
                while !done.load(Ordering::Acquire) {
                    for site in &sites {
                        std::hint::black_box(ctx.branch(*site));
                    }
                }
            });
        }

        let result = toggle_rounds(labels, &keys, rounds);
        done.store(true, Ordering::Release);
        result
    });
    toggled?;

    let stats = labels.stats();
    info!(
        readers,
        rounds,
        elapsed_ms = started.elapsed().as_millis(),
        "Stress run finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.wild_fetches > 0 {
        warn!(wild_fetches = stats.wild_fetches, "Readers fetched torn instructions");
        eyre::bail!("{} wild fetches", stats.wild_fetches);
    }
    let problems = labels.verify();
    if !problems.is_empty() {
        eyre::bail!("{} site(s) do not match their key", problems.len());
    }
    Ok(())
}
