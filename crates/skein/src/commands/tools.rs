//! `skein tools`: list the tools a server offers.

use anyhow::Result;
use clap::Args;
use serde_json::json;
use skein_mcp::protocol::ToolInfo;

use super::{Context, TargetArgs, connect, truncate};

/// Arguments for `skein tools`.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Show full input schemas
    #[arg(long)]
    pub full: bool,
}

/// Run `skein tools`.
pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let client = connect(&args.target, ctx).await?;
    let listed = client.list_tools().await;
    let server = client.server_info();
    client.shutdown().await;
    let tools = listed?;

    if ctx.json_output {
        let output = json!({
            "server": server,
            "tools": tools,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(info) = &server {
        println!("{} v{}", info.name, info.version);
        println!();
    }
    print_table(&tools, args.full || ctx.verbose)?;
    Ok(())
}

fn print_table(tools: &[ToolInfo], full: bool) -> Result<()> {
    if tools.is_empty() {
        println!("No tools.");
        return Ok(());
    }

    println!("{:<30} {:<50}", "NAME", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for tool in tools {
        println!(
            "{:<30} {:<50}",
            truncate(&tool.name, 30),
            truncate(tool.description.as_deref().unwrap_or(""), 50)
        );
        if full && let Some(schema) = &tool.input_schema {
            for line in serde_json::to_string_pretty(schema)?.lines() {
                println!("    {}", line);
            }
        }
    }
    Ok(())
}
