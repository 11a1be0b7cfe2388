use anyhow::Context;
use rotup::{Config, platform::Platform};

use crate::args::{ConfigArgs, ConfigSubArgs};

pub fn config(args: ConfigArgs) -> anyhow::Result<i32> {
    let path = Config::path_or_default(args.config.as_deref())?;
    match args.sub {
        ConfigSubArgs::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists, pass --force to overwrite it", path.display());
            }
            Config::default().store(&path)?;
            println!("Wrote default configuration to {}", path.display());
            println!("Fill in `source_directories` and `disk_rotation` before the first run.");
        }
        ConfigSubArgs::Show => {
            let config = Config::load(&path)?;
            println!("# {}", path.display());
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?
            );
            if let Err(e) = config.validate(Platform::current()) {
                println!("warning: {e}");
            }
        }
    }
    Ok(0)
}
