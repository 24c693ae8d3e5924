use std::{io::Read, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use rpchat_core_sdk::{
    db, description, llm,
    models::ProviderConfig,
    node::{self, Operation},
    server, telemetry,
};

/**
 * \brief CLI 程序入口：以命令行充当工作流宿主。
 */
#[derive(Parser, Debug)]
#[command(name = "rpchat", version, about = "Role-play chat node for OpenAI, Anthropic and Ollama endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 保存凭据并设为默认。
     */
    Init {
        #[arg(long, default_value = "default")]
        name: String,
        /// openai | anthropic | ollama
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        base_url: String,
        #[arg(long, default_value = "")]
        api_key: String,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /**
     * \brief 列出已保存的凭据。
     */
    Credentials,

    /**
     * \brief 执行一批条目；输入为 JSON 数组（或单个对象），缺省从标准输入读取。
     */
    Run {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value = "chat")]
        operation: String,
        /// 凭据名称，缺省使用默认凭据
        #[arg(long)]
        credential: Option<String>,
        #[arg(long, default_value_t = false)]
        continue_on_fail: bool,
    },

    /**
     * \brief 列出凭据可用的模型。
     */
    Models {
        #[arg(long)]
        credential: Option<String>,
    },

    /**
     * \brief 输出节点与凭据的属性描述。
     */
    Describe,

    /**
     * \brief 启动本地 HTTP 宿主。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5678")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Init {
            name,
            provider,
            base_url,
            api_key,
            enable_telemetry,
        } => {
            let id = db::upsert_default_credential(&conn, &name, &provider, &base_url, &api_key)
                .context("save credential failed")?;
            db::set_telemetry_enabled(&conn, enable_telemetry).context("save telemetry failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Saved credential id={} (name={} | {} | {})",
                id, name, provider, base_url
            );
        }
        Commands::Credentials => {
            let default_id = db::get_default_credential_id(&conn)?;
            for cred in db::list_credentials(&conn).context("list credentials failed")? {
                let marker = if default_id == Some(cred.id) { "*" } else { " " };
                println!(
                    "{} {:>3}  {:<16} {:<10} {}",
                    marker, cred.id, cred.name, cred.provider_type, cred.base_url
                );
            }
        }
        Commands::Run {
            input,
            operation,
            credential,
            continue_on_fail,
        } => {
            let operation: Operation = operation.parse()?;
            let provider = resolve_provider(&conn, credential.as_deref())?;
            let items = read_items(input.as_ref()).context("read items failed")?;

            telemetry::log_event(
                "cli.run",
                &format!(
                    "provider={} operation={:?} items={}",
                    provider.provider_type,
                    operation,
                    items.len()
                ),
            );

            let results = node::execute(&provider, operation, &items, continue_on_fail)
                .await
                .context("node execution failed")?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Models { credential } => {
            let provider = resolve_provider(&conn, credential.as_deref())?;
            let models = llm::list_models(&provider)
                .await
                .context("list models failed")?;
            for m in models {
                if m.description.is_empty() {
                    println!("{}\t{}", m.id, m.name);
                } else {
                    println!("{}\t{}\t{}", m.id, m.name, m.description);
                }
            }
        }
        Commands::Describe => {
            let doc = serde_json::json!({
                "node": description::node_description(),
                "credential": description::credential_description()
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Serve { addr } => {
            drop(conn);
            server::run(&addr).await?;
        }
    }

    Ok(())
}

fn resolve_provider(conn: &rusqlite::Connection, name: Option<&str>) -> Result<ProviderConfig> {
    let credential = match name {
        Some(name) => db::get_credential_by_name(conn, name)
            .context("load credential failed")?
            .with_context(|| format!("credential `{}` not found", name))?,
        None => db::get_default_credential(conn)
            .context("load credential failed")?
            .context("no default credential, run: rpchat init --base-url ... --api-key ...")?,
    };
    Ok(credential.to_provider_config()?)
}

/**
 * \brief 读取条目：文件或标准输入，单个对象视为一条。
 */
fn read_items(input: Option<&PathBuf>) -> Result<Vec<Value>> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read {} failed", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    match serde_json::from_str::<Value>(&raw).context("items must be JSON")? {
        Value::Array(items) => Ok(items),
        obj @ Value::Object(_) => Ok(vec![obj]),
        other => bail!("items must be a JSON array or object, got {}", other),
    }
}
