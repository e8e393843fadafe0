use crate::output::UserOutput;
use devfleet::Config;

pub fn run_order(config: &Config, services: &[String], out: &dyn UserOutput) -> anyhow::Result<()> {
    config.validate()?;
    let order = config.startup_order(services)?;
    for (i, name) in order.iter().enumerate() {
        let deps = &config.services[name].depends_on;
        if deps.is_empty() {
            out.status(&format!("{:>3}. {}", i + 1, name));
        } else {
            out.status(&format!("{:>3}. {} (after {})", i + 1, name, deps.join(", ")));
        }
    }
    Ok(())
}
