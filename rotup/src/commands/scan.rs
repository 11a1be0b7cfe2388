use std::sync::Arc;

use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use rotup::{
    Config,
    exec::SystemRunner,
    platform::{self, Platform},
    rotation::{identity_matches, select_volume},
    volume::VolumeDescriptor,
};

use crate::args::ScanArgs;

pub fn scan(args: ScanArgs) -> anyhow::Result<i32> {
    let path = Config::path_or_default(args.config.as_deref())?;
    let config = match Config::load(&path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("{e:#}, rotation membership is not shown");
            None
        }
    };
    let timeout = config
        .as_ref()
        .map(Config::command_timeout)
        .unwrap_or_else(|| Config::default().command_timeout());
    let allowed = config
        .map(|config| config.rotation(Platform::current()).allowed)
        .unwrap_or_default();

    let catalog = platform::system_catalog(Arc::new(SystemRunner), timeout);
    let scan = catalog.scan();
    if let Some(e) = &scan.unavailable {
        eprintln!("Volume catalog unavailable: {e}");
        return Ok(1);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["identity", "kind", "name", "device", "filesystem", "rotation"]);
    for (volume, mark) in scan
        .volumes
        .iter()
        .zip(rotation_marks(&scan.volumes, &allowed))
    {
        table.add_row(vec![
            volume.identity.clone(),
            volume.kind.to_string(),
            volume.display_name.clone(),
            volume.mount_hint.clone(),
            volume.fs_type.clone().unwrap_or_default(),
            mark.to_string(),
        ]);
    }
    println!("{table}");
    Ok(0)
}

/// `selected` for the disk a run would use, `member` for the rest of the set.
fn rotation_marks(volumes: &[VolumeDescriptor], allowed: &[String]) -> Vec<&'static str> {
    let selected = select_volume(volumes, allowed).ok();
    volumes
        .iter()
        .map(|volume| {
            if selected.is_some_and(|s| std::ptr::eq(s, volume)) {
                "selected"
            } else if allowed
                .iter()
                .any(|entry| identity_matches(entry, &volume.identity))
            {
                "member"
            } else {
                ""
            }
        })
        .collect()
}
