use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use inventory_tools::{
    config::{self, AppConfig},
    InventoryTools, ProductRemoval, ReceiveItem, ReceiveRequest, ReceiveTarget, UnreceiveRequest,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let app_config = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&app_config.log_level, app_config.log_json);
    let tools = InventoryTools::from_config(&app_config).context("failed to build API client")?;

    match cli.command {
        Commands::Receive(args) => handle_receive(&tools, &app_config, args, cli.json).await?,
        Commands::Unreceive(args) => handle_unreceive(&tools, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "inventory-tools",
    about = "Receive and reverse purchase order receipts against the inventory API",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record receipts against a purchase order
    Receive(ReceiveArgs),
    /// Remove or reduce recorded receipts
    Unreceive(UnreceiveArgs),
}

#[derive(Args)]
struct ReceiveArgs {
    #[arg(help = "Purchase order id")]
    purchase_order_id: i64,
    #[arg(
        long,
        action = ArgAction::SetTrue,
        conflicts_with = "items",
        help = "Receive the remaining quantity of every line"
    )]
    all: bool,
    #[arg(
        long = "item",
        value_parser = parse_receive_item,
        help = "line:<id>=<qty>[:serial,...] or product:<id>=<qty>[:serial,...]; repeatable"
    )]
    items: Vec<ReceiveItem>,
    #[arg(long, value_parser = parse_datetime, help = "Receive date (RFC3339); defaults to now")]
    date: Option<DateTime<Utc>>,
    #[arg(long, help = "Destination location id for every item")]
    location: Option<i64>,
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Allow receiving more than was ordered"
    )]
    allow_over_receive: bool,
}

#[derive(Args)]
struct UnreceiveArgs {
    #[arg(help = "Purchase order id")]
    purchase_order_id: i64,
    #[arg(long, action = ArgAction::SetTrue, help = "Remove every receipt")]
    all: bool,
    #[arg(long = "entry", help = "Receipt id to remove; repeatable")]
    entries: Vec<i64>,
    #[arg(
        long = "product",
        value_parser = parse_product_removal,
        help = "<product_id>=<qty> to remove newest first; repeatable"
    )]
    products: Vec<ProductRemoval>,
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Preview the change without writing it"
    )]
    dry_run: bool,
}

async fn handle_receive(tools: &InventoryTools, app_config: &AppConfig, args: ReceiveArgs, json: bool) -> Result<()> {
    let items = args
        .items
        .into_iter()
        .map(|mut item| {
            item.location_id = item.location_id.or(args.location);
            item
        })
        .collect();

    let request = ReceiveRequest {
        purchase_order_id: args.purchase_order_id,
        receive_all: args.all,
        items,
        received_date: args.date,
        allow_over_receive: args.allow_over_receive,
    };
    debug!(api = %app_config.api_base_url, ?request, "Submitting receive");

    let summary = tools
        .receiving
        .receive(request)
        .await
        .with_context(|| format!("failed to receive purchase order {}", args.purchase_order_id))?;

    if json {
        print_json(&summary)?;
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

async fn handle_unreceive(tools: &InventoryTools, args: UnreceiveArgs, json: bool) -> Result<()> {
    let request = UnreceiveRequest {
        purchase_order_id: args.purchase_order_id,
        entry_ids: args.entries,
        products: args.products,
        all: args.all,
        dry_run: args.dry_run,
    };

    let summary = tools
        .unreceiving
        .unreceive(request)
        .await
        .with_context(|| format!("failed to unreceive purchase order {}", args.purchase_order_id))?;

    if json {
        print_json(&summary)?;
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_receive_item(raw: &str) -> Result<ReceiveItem, String> {
    let (kind, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("invalid item '{raw}', expected line:<id>=<qty> or product:<id>=<qty>"))?;
    let (id, rest) = rest
        .split_once('=')
        .ok_or_else(|| format!("invalid item '{raw}', missing =<qty>"))?;
    let id: i64 = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid id '{id}'"))?;

    let target = match kind.trim() {
        "line" => ReceiveTarget::Line(id),
        "product" => ReceiveTarget::Product(id),
        other => return Err(format!("unrecognized item kind '{other}', expected line or product")),
    };

    let (quantity, serials) = match rest.split_once(':') {
        Some((quantity, serials)) => (quantity, Some(serials)),
        None => (rest, None),
    };

    let serial_numbers = serials
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|serial| !serial.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ReceiveItem {
        target,
        quantity: parse_decimal(quantity.trim())?,
        serial_numbers,
        location_id: None,
    })
}

fn parse_product_removal(raw: &str) -> Result<ProductRemoval, String> {
    let (product_id, quantity) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid product '{raw}', expected <product_id>=<qty>"))?;
    Ok(ProductRemoval {
        product_id: product_id
            .trim()
            .parse()
            .map_err(|_| format!("invalid product id '{product_id}'"))?,
        quantity: parse_decimal(quantity.trim())?,
    })
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw).map_err(|_| format!("invalid decimal '{raw}'"))
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("invalid datetime '{}', expected RFC3339", raw))
}
