//! `skein call`: invoke one tool and print its result.

use anyhow::{Context as _, Result};
use clap::Args;
use serde_json::Value;

use super::{Context, TargetArgs, connect};

/// Arguments for `skein call`.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Tool name
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(id = "tool_args", long = "args", short = 'a', value_name = "ARGS", default_value = "{}")]
    pub args: String,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// Parse `--args`, which must be a JSON object.
pub fn parse_arguments(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--args is not valid JSON: {}", raw))?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(value)
}

/// Run `skein call`.
pub async fn run(args: CallArgs, ctx: &Context) -> Result<()> {
    let arguments = parse_arguments(&args.args)?;
    let client = connect(&args.target, ctx).await?;
    let called = client.call_tool(&args.tool, Some(arguments), None).await;
    client.shutdown().await;
    let result = called?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !result.is_error {
        println!("{}", result.joined_text());
    }

    if result.is_error {
        anyhow::bail!("tool '{}' failed: {}", args.tool, result.joined_text());
    }
    Ok(())
}
