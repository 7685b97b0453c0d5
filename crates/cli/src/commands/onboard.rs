//! `nimbot onboard` — First-time setup.

use std::path::Path;

use nimbot_config::AppConfig;

/// Workspace files created on first run, relative to the workspace root.
const TEMPLATES: &[(&str, &str)] = &[
    (
        "AGENTS.md",
        "# Agent Instructions\n\n\
         You are a helpful personal assistant. Be concise, accurate and friendly.\n\n\
         - Explain what you are doing before taking actions\n\
         - Ask for clarification when the request is ambiguous\n\
         - Use `spawn` for long-running work so the user is not kept waiting\n",
    ),
    (
        "SOUL.md",
        "# Personality\n\n\
         - Be concise and direct\n\
         - Be honest about limitations and uncertainties\n",
    ),
    (
        "USER.md",
        "# User\n\n\
         <!-- Add information about yourself that the agent should know -->\n\
         - Name: (edit this)\n\
         - Timezone: (edit this)\n",
    ),
    (
        "TOOLS.md",
        "# Tool Notes\n\n\
         <!-- Conventions for using tools in this workspace -->\n",
    ),
    (
        "HEARTBEAT.md",
        "# Heartbeat Tasks\n\n\
         <!-- Tasks listed here are checked periodically when the heartbeat is enabled -->\n",
    ),
    (
        "memory/MEMORY.md",
        "# Long-term Memory\n\n\
         <!-- Important facts the agent should remember across sessions -->\n",
    ),
];

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = AppConfig::config_path();

    println!("Nimbot — First-Time Setup");
    println!("=========================\n");

    std::fs::create_dir_all(&config_dir)?;
    if config_path.exists() {
        println!("  Config already exists at: {}", config_path.display());
        println!("  Edit it manually or delete and re-run onboard.\n");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("  Created {}", config_path.display());
    }

    let config = AppConfig::load_from(&config_path)?;
    let workspace = config.agent.workspace_path();
    for created in write_templates(&workspace)? {
        println!("  Created {created}");
    }

    println!("\n  Next steps:");
    println!("   1. Add your API key to {}", config_path.display());
    println!("   2. Run: nimbot agent -m \"Hello!\"");
    println!("   3. Enable channels and run: nimbot gateway\n");
    Ok(())
}

/// Create missing workspace templates, returning the ones written.
/// Existing files are never overwritten.
pub fn write_templates(workspace: &Path) -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(workspace.join("skills"))?;
    let mut created = Vec::new();
    for (name, content) in TEMPLATES {
        let path = workspace.join(name);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        created.push((*name).to_string());
    }
    Ok(created)
}
