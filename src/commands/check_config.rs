use devfleet::config::format_duration;
use devfleet::Parser as ConfigParser;
use std::path::PathBuf;

pub fn run_check_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let parser = ConfigParser::new();
    let config_path = match config_path {
        Some(path) => path,
        None => match parser.find_config_file() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("Error: No services file found");
                eprintln!("\nSearched for devfleet.yaml in:");
                eprintln!(
                    "  - Current directory: {}",
                    std::env::current_dir()?.display()
                );
                eprintln!("  - Parent directories up to root");
                return Err(e.into());
            }
        },
    };

    println!("Validating {}...", config_path.display());
    let config = parser.load_config(&config_path)?;
    println!("Configuration is valid\n");

    println!("Services: {}", config.services.len());
    for service in &config.services {
        let port = match (service.port, service.assign_port) {
            (Some(port), _) => format!(", port {}", port),
            (None, true) => ", port assigned".to_string(),
            (None, false) => String::new(),
        };
        println!("  - {} ({}{})", service.name, service.mode, port);
    }

    let settings = &config.settings;
    println!("\nSettings:");
    println!(
        "  ports {}-{}, lock timeout {}, readiness timeout {}, stop grace {}",
        settings.port_range_start,
        settings.port_range_end,
        format_duration(settings.lock_timeout),
        format_duration(settings.readiness_timeout),
        format_duration(settings.stop_grace)
    );
    Ok(())
}
