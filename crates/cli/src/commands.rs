//! Client commands.

use std::fmt;

use anyhow::Context;
use clap::Subcommand;
use corelib::{Node, NodeId, RequestHeader, ResponseHeader};
use gateway::{Gateway, ReqIter, RequestContext, WorkQueue};
use transport::RequestExecutor;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read part of an object from one node
    Read {
        #[arg(long)]
        node: NodeId,
        #[arg(long, value_parser = parse_oid)]
        oid: u64,
        #[arg(long)]
        len: u32,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Write bytes to an object on one node
    Write {
        #[arg(long)]
        node: NodeId,
        #[arg(long, value_parser = parse_oid)]
        oid: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        data: String,
    },

    /// Read consecutive stripes of an object, one stripe per node
    Fanout {
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<NodeId>,
        #[arg(long, value_parser = parse_oid)]
        oid: u64,
        #[arg(long)]
        stripe: u32,
        #[arg(long, default_value_t = 0)]
        copy_policy: u8,
    },
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_oid(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid object id {:?}: {}", s, e))
}

/// Outcome of one target in a fan-out.
#[derive(Debug)]
pub struct FanoutItem {
    pub nid: NodeId,
    pub outcome: Result<ResponseHeader, String>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum CommandResult {
    Read {
        header: ResponseHeader,
        data: Vec<u8>,
    },
    Write {
        header: ResponseHeader,
    },
    Fanout {
        items: Vec<FanoutItem>,
    },
}

impl Command {
    /// Runs the command. Must not be called on the transport's main thread.
    pub fn execute<E, Q>(&self, executor: &E, gateway: &Gateway<E, Q>) -> anyhow::Result<CommandResult>
    where
        E: RequestExecutor,
        Q: WorkQueue,
    {
        match self {
            Command::Read {
                node,
                oid,
                len,
                offset,
            } => {
                let hdr = RequestHeader::read_obj(*oid, *len, *offset);
                let mut data = vec![0u8; *len as usize];
                let header = executor
                    .exec_req(node, &hdr, Some(&mut data))
                    .with_context(|| format!("read {:#x} from {}", oid, node))?;
                data.truncate(header.data_length as usize);
                Ok(CommandResult::Read { header, data })
            }
            Command::Write {
                node,
                oid,
                offset,
                data,
            } => {
                let mut body = data.clone().into_bytes();
                let len = u32::try_from(body.len()).context("write body too large")?;
                let hdr = RequestHeader::write_obj(*oid, len, *offset);
                let header = executor
                    .exec_req(node, &hdr, Some(&mut body))
                    .with_context(|| format!("write {:#x} to {}", oid, node))?;
                Ok(CommandResult::Write { header })
            }
            Command::Fanout {
                nodes,
                oid,
                stripe,
                copy_policy,
            } => {
                let targets: Vec<Node> = nodes
                    .iter()
                    .enumerate()
                    .map(|(i, nid)| Node::new(*nid, format!("target-{}", i)))
                    .collect();
                let mut reqs: Vec<ReqIter> = (0..nodes.len() as u64)
                    .map(|i| ReqIter::read(*stripe, i * u64::from(*stripe)))
                    .collect();
                let rctx = RequestContext {
                    epoch: 0,
                    copy_policy: *copy_policy,
                };

                let results = gateway.send_gateway_reqs_detailed(
                    &RequestHeader::read_obj(*oid, 0, 0),
                    &targets,
                    &mut reqs,
                    &rctx,
                )?;

                let items = targets
                    .iter()
                    .zip(results)
                    .zip(reqs)
                    .map(|((target, result), req)| {
                        let mut data = req.buf;
                        let outcome = result.map_err(|e| e.to_string());
                        if let Ok(header) = &outcome {
                            data.truncate(header.data_length as usize);
                        }
                        FanoutItem {
                            nid: target.nid,
                            outcome,
                            data,
                        }
                    })
                    .collect();
                Ok(CommandResult::Fanout { items })
            }
        }
    }
}

fn preview(data: &[u8]) -> String {
    const MAX: usize = 64;
    let shown = &data[..data.len().min(MAX)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if data.len() > MAX {
        text.push_str("...");
    }
    text
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Read { header, data } => {
                write!(f, "{} ({} bytes) {}", header.result, data.len(), preview(data))
            }
            CommandResult::Write { header } => write!(f, "{}", header.result),
            CommandResult::Fanout { items } => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    match &item.outcome {
                        Ok(header) => write!(
                            f,
                            "{} {} ({} bytes) {}",
                            item.nid,
                            header.result,
                            item.data.len(),
                            preview(&item.data)
                        )?,
                        Err(err) => write!(f, "{} failed: {}", item.nid, err)?,
                    }
                }
                Ok(())
            }
        }
    }
}
