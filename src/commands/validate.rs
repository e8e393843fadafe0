use crate::output::UserOutput;
use devfleet::Config;
use std::path::Path;

pub fn run_validate(config: &Config, config_path: &Path, out: &dyn UserOutput) -> anyhow::Result<()> {
    out.status(&format!("Validating {}...", config_path.display()));

    config.validate()?;

    out.success("Configuration is valid\n");

    out.status(&format!("  Services: {}", config.services.len()));
    for (name, service) in &config.services {
        let port = match (service.port, service.port_range) {
            (Some(port), _) => port.to_string(),
            (None, Some([start, end])) => format!("{}-{}", start, end),
            (None, None) => format!("auto ({})", service.class),
        };
        out.status(&format!("    - {} (port {})", name, port));
    }
    out.status(&format!("  Startup order: {}", config.startup_order(&[])?.join(" -> ")));
    Ok(())
}
