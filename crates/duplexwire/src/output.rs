use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use duplexwire_session::{FramingMode, Message};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    via: &'a str,
    mode: String,
    action: &'a str,
    relates_to: Option<u64>,
    fault: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault_reason: Option<String>,
    body_size: usize,
    body: String,
}

impl<'a> ReplyOutput<'a> {
    fn new(reply: &'a Message, via: &'a str, mode: FramingMode) -> Self {
        let fault = reply.fault_detail();
        Self {
            via,
            mode: mode.to_string(),
            action: reply.action(),
            relates_to: reply.relates_to(),
            fault: reply.is_fault(),
            fault_code: fault.as_ref().map(|f| format!("{:?}", f.code)),
            fault_reason: fault.map(|f| f.reason),
            body_size: reply.body.len(),
            body: body_preview(reply.body.as_ref()),
        }
    }
}

pub fn print_reply(reply: &Message, via: &str, mode: FramingMode, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput::new(reply, via, mode);
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let out = ReplyOutput::new(reply, via, mode);
            let status = match (&out.fault_code, &out.fault_reason) {
                (Some(code), Some(reason)) => format!("{code}: {reason}"),
                _ if out.fault => "fault".to_string(),
                _ => "ok".to_string(),
            };
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MODE", "ACTION", "STATUS", "SIZE", "BODY"])
                .add_row(vec![
                    out.mode,
                    out.action.to_string(),
                    status,
                    out.body_size.to_string(),
                    out.body,
                ]);
            println!("{table}");
        }
        OutputFormat::Raw => print_raw(reply.body.as_ref()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}
