//! Parsers for PBS command output.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::Event;
use rustc_hash::FxHashMap;

use crate::accounts::AccountMap;
use crate::error::{ParseError, UnitError};
use crate::pbs::units::{parse_duration, parse_flag, parse_integer, parse_size, parse_timestamp};
use crate::record::{FieldValue, JobRecord, JobState};

const ROOT: &str = "Data";
const JOB: &str = "Job";
const JOB_ID: &str = "Job_Id";
const RESOURCE_LIST: &str = "Resource_List.";
const RESOURCES_USED: &str = "resources_used.";
const REQ_INFORMATION: &str = "req_information.";

/// Parse qsub output to extract the scheduler job ID.
///
/// qsub output format varies by PBS implementation:
/// - PBS Pro: "12345.pbs-server"
/// - Torque: "12345.server.domain.com"
/// - Array jobs: "12345[].server"
///
/// Some sites print a banner before the ID, so only the last non-empty line
/// is considered.
pub fn parse_qsub_output(output: &str) -> Option<String> {
    let line = output.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let number = line.split('.').next()?;
    let number = number.split('[').next()?;
    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) && !line.contains(char::is_whitespace) {
        Some(line.to_string())
    } else {
        None
    }
}

/// Parse a `qstat -x` snapshot into job records.
///
/// qstat -x output format (one line, shown indented):
/// ```text
/// <Data>
///   <Job>
///     <Job_Id>12345.pbs-server</Job_Id>
///     <Job_Owner>alice@login01</Job_Owner>
///     <job_state>R</job_state>
///     <Resource_List><nodes>2:ppn=4</nodes></Resource_List>
///     <req_information><task_count.0>1</task_count.0></req_information>
///   </Job>
/// </Data>
/// ```
///
/// Nested elements become dotted keys (`Resource_List.nodes`). A snapshot
/// that stops before `</Data>` is rejected, so a read that races the
/// scheduler never yields a short job list. An empty snapshot parses to an
/// empty list.
pub fn parse_snapshot(raw: &[u8], accounts: &AccountMap) -> Result<Vec<JobRecord>, ParseError> {
    let text = String::from_utf8_lossy(raw);
    split_blocks(&text)?
        .iter()
        .map(|block| build_record(block, accounts))
        .collect()
}

/// One `<Job>` element and its attributes, in snapshot order.
#[derive(Debug)]
struct JobBlock {
    full_id: String,
    attrs: Vec<(String, String)>,
}

/// Event-by-event builder for the `<Data><Job>...</Job></Data>` tree.
#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<JobBlock>,
    /// Open elements, root first.
    path: Vec<String>,
    /// Text of the innermost open attribute element, while it has no children.
    leaf: Option<String>,
    root_closed: bool,
}

impl BlockBuilder {
    fn open(&mut self, name: String) -> Result<(), String> {
        match self.path.len() {
            _ if self.root_closed => return Err(format!("<{name}> after </{ROOT}>")),
            0 if name != ROOT => return Err(format!("root element <{name}>, expected <{ROOT}>")),
            1 if name != JOB => return Err(format!("<{name}> directly under <{ROOT}>")),
            1 => self.blocks.push(JobBlock {
                full_id: String::new(),
                attrs: Vec::new(),
            }),
            _ => {}
        }
        self.path.push(name);
        // The parent, if any, turned out to be a container.
        self.leaf = (self.path.len() > 2).then(String::new);
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), String> {
        match self.leaf.as_mut() {
            Some(leaf) => {
                leaf.push_str(text);
                Ok(())
            }
            None if self.path.len() > 2 => Ok(()),
            None => Err(format!("stray text {text:?}")),
        }
    }

    fn close(&mut self) -> Result<(), ParseError> {
        if self.path.len() > 2 {
            if let Some(value) = self.leaf.take() {
                let key = self.path[2..].join(".");
                self.push_attr(key, value);
            }
        } else if self.path.len() == 2 && self.blocks.last().is_some_and(|b| b.full_id.is_empty()) {
            return Err(ParseError::MissingAttribute {
                job_id: format!("#{}", self.blocks.len()),
                attribute: JOB_ID,
            });
        } else if self.path.len() == 1 {
            self.root_closed = true;
        }
        self.path.pop();
        Ok(())
    }

    fn push_attr(&mut self, key: String, value: String) {
        let Some(block) = self.blocks.last_mut() else {
            return;
        };
        let value = value.trim().to_string();
        if key == JOB_ID {
            block.full_id = value;
        } else {
            block.attrs.push((key, value));
        }
    }

    fn finish(self) -> Result<Vec<JobBlock>, ParseError> {
        if let Some(open) = self.path.last() {
            return Err(ParseError::Truncated { open: open.clone() });
        }
        if !self.root_closed {
            return Err(ParseError::Truncated { open: ROOT.to_string() });
        }
        Ok(self.blocks)
    }
}

fn split_blocks(text: &str) -> Result<Vec<JobBlock>, ParseError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut builder = BlockBuilder::default();

    loop {
        let position = reader.buffer_position() as u64;
        let malformed = |message: String| ParseError::Xml { position, message };

        match reader.read_event().map_err(|e| malformed(e.to_string()))? {
            Event::Start(tag) => builder
                .open(String::from_utf8_lossy(tag.name().as_ref()).into_owned())
                .map_err(malformed)?,
            Event::Empty(tag) => {
                builder
                    .open(String::from_utf8_lossy(tag.name().as_ref()).into_owned())
                    .map_err(malformed)?;
                builder.close()?;
            }
            Event::End(_) => builder.close()?,
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| malformed(e.to_string()))?;
                builder.text(&text).map_err(malformed)?;
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                builder.text(&text).map_err(malformed)?;
            }
            Event::Eof => break,
            // Declaration, comments, processing instructions, doctype.
            _ => {}
        }
    }

    builder.finish()
}

/// Attribute lookup for one block with error context.
struct Fields<'a> {
    job_id: &'a str,
    attrs: FxHashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    fn new(block: &'a JobBlock) -> Self {
        let mut attrs = FxHashMap::default();
        for (key, value) in &block.attrs {
            attrs.entry(key.as_str()).or_insert(value.as_str());
        }
        Self {
            job_id: &block.full_id,
            attrs,
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.attrs.get(key).copied()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn require(&self, attribute: &'static str) -> Result<&'a str, ParseError> {
        self.get(attribute).ok_or_else(|| ParseError::MissingAttribute {
            job_id: self.job_id.to_string(),
            attribute,
        })
    }

    fn invalid(&self, attribute: &str, source: UnitError) -> ParseError {
        ParseError::InvalidValue {
            job_id: self.job_id.to_string(),
            attribute: attribute.to_string(),
            source,
        }
    }

    fn convert<T>(&self, key: &str, parse: impl Fn(&str) -> Result<T, UnitError>) -> Result<Option<T>, ParseError> {
        self.get(key)
            .map(|value| parse(value).map_err(|e| self.invalid(key, e)))
            .transpose()
    }
}

fn build_record(block: &JobBlock, accounts: &AccountMap) -> Result<JobRecord, ParseError> {
    let fields = Fields::new(block);

    let owner = fields.require("Job_Owner")?;
    let owner = owner.split('@').next().unwrap_or(owner).to_string();
    let state_code = fields.require("job_state")?.to_string();
    let server = fields.require("server")?.to_string();
    let account = fields.require("Account_Name")?.to_string();
    let qos = fields.get("Resource_List.qos");

    let (cluster, queue) = accounts
        .resolve(&account, &server, qos)
        .ok_or_else(|| ParseError::UnknownAccount {
            job_id: block.full_id.clone(),
            account: account.clone(),
        })?;

    // Torque spells it exit_status, PBS Pro Exit_status.
    let exit_status = match ["exit_status", "Exit_status"]
        .into_iter()
        .find(|key| fields.get(key).is_some())
    {
        Some(key) => fields.convert(key, |v| {
            let n = parse_integer(v)?;
            i32::try_from(n).map_err(|_| UnitError::InvalidInteger(v.to_string()))
        })?,
        None => None,
    };

    let mut record = JobRecord {
        job_id: block.full_id.split('.').next().unwrap_or_default().to_string(),
        full_job_id: block.full_id.clone(),
        name: fields.text("Job_Name").unwrap_or_default(),
        owner,
        state: JobState::from_code(&state_code),
        state_code,
        server,
        account,
        raw_queue: fields.text("queue"),
        cluster,
        queue,
        qos: qos.map(str::to_string),
        submit_args: fields.text("submit_args"),
        submit_host: fields.text("submit_host"),
        exec_host: fields.text("exec_host"),
        init_work_dir: fields.text("init_work_dir"),
        interactive: fields.get("interactive").map(parse_flag),
        exit_status,
        start_time: fields.convert("start_time", parse_timestamp)?,
        create_time: fields.convert("ctime", parse_timestamp)?,
        eligible_time: fields.convert("etime", parse_timestamp)?,
        modify_time: fields.convert("mtime", parse_timestamp)?,
        queued_time: fields.convert("qtime", parse_timestamp)?,
        completion_time: fields.convert("comp_time", parse_timestamp)?,
        walltime: None,
        total_runtime: fields.convert("total_runtime", parse_duration)?,
        used_cpu_time: None,
        used_walltime: None,
        requested_nodes: None,
        requested_cpus_per_node: None,
        requested_memory_bytes: None,
        used_memory_bytes: None,
        used_virtual_memory_bytes: None,
        extra: BTreeMap::new(),
    };

    if let Some(remaining) = fields.convert("Walltime.Remaining", parse_duration)? {
        record
            .extra
            .insert("walltime_remaining".to_string(), FieldValue::Duration(remaining));
    }

    let mut req_info: BTreeMap<String, Vec<FieldValue>> = BTreeMap::new();
    for (key, value) in &block.attrs {
        if let Some(name) = key.strip_prefix(RESOURCE_LIST) {
            apply_requested(&mut record, &fields, key, name, value)?;
        } else if let Some(name) = key.strip_prefix(RESOURCES_USED) {
            apply_used(&mut record, &fields, key, name, value)?;
        } else if let Some(name) = key.strip_prefix(REQ_INFORMATION) {
            collect_req_information(&mut req_info, &fields, key, name, value)?;
        }
    }

    for (name, mut values) in req_info {
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            FieldValue::Text(values.iter().map(ToString::to_string).collect::<Vec<_>>().join(","))
        };
        record.extra.insert(format!("req_info_{name}"), value);
    }

    Ok(record)
}

fn apply_requested(
    record: &mut JobRecord,
    fields: &Fields<'_>,
    key: &str,
    name: &str,
    value: &str,
) -> Result<(), ParseError> {
    match name {
        "qos" => {}
        "nodes" => apply_nodes(record, fields, key, value)?,
        "walltime" => record.walltime = Some(parse_duration(value).map_err(|e| fields.invalid(key, e))?),
        "mem" => record.requested_memory_bytes = Some(parse_size(value).map_err(|e| fields.invalid(key, e))?),
        _ => {
            let parsed = typed_value(fields, key, name, value)?;
            record.extra.insert(format!("req_{name}"), parsed);
        }
    }
    Ok(())
}

fn apply_used(
    record: &mut JobRecord,
    fields: &Fields<'_>,
    key: &str,
    name: &str,
    value: &str,
) -> Result<(), ParseError> {
    let size = |v: &str| parse_size(v).map_err(|e| fields.invalid(key, e));
    let duration = |v: &str| parse_duration(v).map_err(|e| fields.invalid(key, e));
    match name {
        "energy_used" => {}
        "mem" => record.used_memory_bytes = Some(size(value)?),
        "vmem" => record.used_virtual_memory_bytes = Some(size(value)?),
        "cput" => record.used_cpu_time = Some(duration(value)?),
        "walltime" => record.used_walltime = Some(duration(value)?),
        _ => {
            let parsed = typed_value(fields, key, name, value)?;
            record.extra.insert(format!("used_{name}"), parsed);
        }
    }
    Ok(())
}

/// Memory-like names are sizes, time-like names are durations, the rest are
/// integers when they look like one.
fn typed_value(fields: &Fields<'_>, key: &str, name: &str, value: &str) -> Result<FieldValue, ParseError> {
    if name.contains("mem") {
        parse_size(value)
            .map(FieldValue::Bytes)
            .map_err(|e| fields.invalid(key, e))
    } else if name.contains("time") || name == "cput" {
        parse_duration(value)
            .map(FieldValue::Duration)
            .map_err(|e| fields.invalid(key, e))
    } else {
        Ok(parse_integer(value)
            .map(FieldValue::Integer)
            .unwrap_or_else(|_| FieldValue::Text(value.to_string())))
    }
}

/// `Resource_List.nodes`, e.g. `2:ppn=4:gpus=1` or `node01+node02:ppn=2`.
fn apply_nodes(record: &mut JobRecord, fields: &Fields<'_>, key: &str, spec: &str) -> Result<(), ParseError> {
    record
        .extra
        .insert("req_nodes_spec".to_string(), FieldValue::Text(spec.to_string()));

    let chunks: Vec<&str> = spec.split('+').collect();
    let counts: Vec<Option<u32>> = chunks
        .iter()
        .map(|chunk| chunk.split(':').next().and_then(|n| n.trim().parse().ok()))
        .collect();
    record.requested_nodes = if counts.iter().all(Option::is_some) {
        Some(counts.iter().flatten().sum())
    } else {
        u32::try_from(chunks.len()).ok()
    };

    let first = chunks.first().copied().unwrap_or_default();
    for property in first.split(':').skip(1) {
        match property.split_once('=') {
            Some(("ppn", n)) => {
                let ppn = parse_integer(n)
                    .and_then(|n| u32::try_from(n).map_err(|_| UnitError::InvalidInteger(n.to_string())))
                    .map_err(|e| fields.invalid(key, e))?;
                record.requested_cpus_per_node = Some(ppn);
            }
            Some((name, v)) => {
                let parsed = parse_integer(v)
                    .map(FieldValue::Integer)
                    .unwrap_or_else(|_| FieldValue::Text(v.to_string()));
                record.extra.insert(format!("req_nodes_{name}"), parsed);
            }
            None => {
                record
                    .extra
                    .insert(format!("req_nodes_{property}"), FieldValue::Flag(true));
            }
        }
    }
    Ok(())
}

/// `req_information.<name>.<index>` attributes, grouped by name.
fn collect_req_information(
    into: &mut BTreeMap<String, Vec<FieldValue>>,
    fields: &Fields<'_>,
    key: &str,
    name: &str,
    value: &str,
) -> Result<(), ParseError> {
    let body = match name.rsplit_once('.') {
        Some((body, index)) if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => body,
        _ => name,
    };
    if body.starts_with("task_usage") {
        return Ok(());
    }
    let body = body.replace('.', "_");

    let parsed = if body == "task_count" || body == "lprocs" {
        parse_integer(value)
            .map(FieldValue::Integer)
            .map_err(|e| fields.invalid(key, e))?
    } else if body.contains("memory") {
        parse_size(value)
            .map(FieldValue::Bytes)
            .map_err(|e| fields.invalid(key, e))?
    } else {
        FieldValue::Text(value.to_string())
    };
    into.entry(body).or_default().push(parsed);
    Ok(())
}
