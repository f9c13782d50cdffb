//! `devhost check`: validate every configured device without starting it.

use devhost_core::DeviceConfiguration;

use crate::cli::{CheckArgs, GlobalOpts, OutputFormat};
use crate::commands::DeviceRow;
use crate::config::Config;
use crate::error::CliError;
use crate::output;
use crate::sim::{self, SensorConfiguration};

pub fn handle(args: &CheckArgs, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    if args.print {
        output::print_output(config.to_toml()?.trim_end(), global.quiet);
        return Ok(());
    }

    let color = matches!(global.output, OutputFormat::Table) && output::should_color(&global.color);
    let factories = sim::factories();
    let mut rows = Vec::new();
    let mut first_error = None;

    for (name, section) in &config.hosts {
        let snapshot = section.snapshot::<SensorConfiguration>(name)?;
        for item in &snapshot.items {
            let verdict = item
                .validate()
                .and_then(|()| factories.resolve(item.kind()).map(|_| ()));
            let (result, detail) = match verdict {
                Ok(()) => (output::paint("ok", false, color), String::new()),
                Err(e) => {
                    let detail = e.to_string();
                    first_error.get_or_insert(e);
                    (output::paint("invalid", true, color), detail)
                }
            };
            rows.push(DeviceRow {
                host: name.clone(),
                device: item.name.clone(),
                policy: item.status.to_string(),
                result,
                detail,
            });
        }
    }

    let out = output::render_list(&global.output, &rows, DeviceRow::clone, DeviceRow::id)?;
    output::print_output(&out, global.quiet);

    match first_error {
        Some(e) => Err(e.into()),
        None => {
            tracing::debug!(hosts = config.hosts.len(), devices = rows.len(), "configuration ok");
            Ok(())
        }
    }
}
