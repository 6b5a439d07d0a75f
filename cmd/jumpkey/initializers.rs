use jumpkey::{Image, ImageBuilder, JumpLabels, KeyId, Polarity};
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_filter(log_filter);
    let subscriber = Registry::default().with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Lay out a synthetic image: `keys` keys, every other one starting enabled,
/// each guarding `sites_per_key` sites of mixed polarity and distance.
pub fn build_image(opts: &Options) -> eyre::Result<Image> {
    let mut builder = ImageBuilder::new(opts.encoding()?);
    let keys: Vec<KeyId> = (0..opts.keys)
        .map(|i| builder.declare_key(i % 2 == 1))
        .collect();

    for n in 0..opts.sites_per_key {
        for (k, &key) in keys.iter().enumerate() {
            let polarity = if (n + k) % 3 == 0 {
                Polarity::Inverted
            } else {
                Polarity::Direct
            };
            let fallthrough = (n * 37 + k * 11) % 200;
            builder.add_site_with_fallthrough(key, polarity, fallthrough);
        }
    }

    Ok(builder.build()?)
}

pub fn load_labels(image: Image, opts: &Options) -> eyre::Result<JumpLabels> {
    let config = opts.patch_config()?;
    let labels = JumpLabels::load(image, config)?;
    info!(
        keys = labels.num_keys(),
        sites = labels.entries().len(),
        encoding = labels.encoding().as_str(),
        "Image ready"
    );
    Ok(labels)
}
