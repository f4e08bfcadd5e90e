//! Output handlers for CLI commands
//!
//! Supports console (key/value blocks and column tables), JSON, and quiet
//! (names only) output modes.

use crate::model::{CronWorkflow, Workflow, WorkflowTemplate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

const KEY_WIDTH: usize = 20;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// Parse from string
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "quiet" => Self::Quiet,
            _ => Self::Console,
        }
    }
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    fn workflow(&self, wf: &Workflow);
    fn workflows(&self, wfs: &[Workflow]);
    fn template(&self, template: &WorkflowTemplate);
    fn templates(&self, templates: &[WorkflowTemplate]);
    fn cron(&self, cron: &CronWorkflow);
    fn crons(&self, crons: &[CronWorkflow]);

    /// Free-form status line
    fn info(&self, message: &str);
}

/// Console output handler
pub struct ConsoleHandler;

impl OutputHandler for ConsoleHandler {
    fn workflow(&self, wf: &Workflow) {
        print!("{}", format_workflow(wf));
    }

    fn workflows(&self, wfs: &[Workflow]) {
        print!("{}", format_workflow_table(wfs, Utc::now()));
    }

    fn template(&self, template: &WorkflowTemplate) {
        print!("{}", format_template(template));
    }

    fn templates(&self, templates: &[WorkflowTemplate]) {
        print!("{}", format_template_table(templates, Utc::now()));
    }

    fn cron(&self, cron: &CronWorkflow) {
        print!("{}", format_cron(cron));
    }

    fn crons(&self, crons: &[CronWorkflow]) {
        print!("{}", format_cron_table(crons, Utc::now()));
    }

    fn info(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// JSON output handler
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn workflow(&self, wf: &Workflow) {
        self.print_json(wf);
    }

    fn workflows(&self, wfs: &[Workflow]) {
        self.print_json(wfs);
    }

    fn template(&self, template: &WorkflowTemplate) {
        self.print_json(template);
    }

    fn templates(&self, templates: &[WorkflowTemplate]) {
        self.print_json(templates);
    }

    fn cron(&self, cron: &CronWorkflow) {
        self.print_json(cron);
    }

    fn crons(&self, crons: &[CronWorkflow]) {
        self.print_json(crons);
    }

    fn info(&self, message: &str) {
        #[derive(Serialize)]
        struct Info<'a> {
            message: &'a str,
        }
        self.print_json(&Info { message });
    }
}

/// Quiet handler that prints object names only
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn workflow(&self, wf: &Workflow) {
        println!("{}", wf.name());
    }

    fn workflows(&self, wfs: &[Workflow]) {
        for wf in wfs {
            println!("{}", wf.name());
        }
    }

    fn template(&self, template: &WorkflowTemplate) {
        println!("{}", template.metadata.name);
    }

    fn templates(&self, templates: &[WorkflowTemplate]) {
        for t in templates {
            println!("{}", t.metadata.name);
        }
    }

    fn cron(&self, cron: &CronWorkflow) {
        println!("{}", cron.metadata.name);
    }

    fn crons(&self, crons: &[CronWorkflow]) {
        for c in crons {
            println!("{}", c.metadata.name);
        }
    }

    fn info(&self, _message: &str) {}
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler),
        OutputMode::Json => Box::new(JsonHandler::new(true)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

fn field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{:<width$} {}", format!("{}:", key), value, width = KEY_WIDTH);
}

fn timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S %Z").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn pairs<'a>(map: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    let joined: Vec<String> = map
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(",")
    }
}

/// Human-readable duration
pub fn format_duration(d: chrono::Duration) -> String {
    let ms = d.num_milliseconds().max(0);
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

/// Coarse age such as `45s`, `12m`, `3h` or `2d`
pub fn format_age(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        0..60 => format!("{}s", secs),
        60..3600 => format!("{}m", secs / 60),
        3600..86_400 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

fn age(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    ts.map(|t| format_age(now - t))
        .unwrap_or_else(|| "-".to_string())
}

/// Render rows under headers with columns padded to the widest cell
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.len());
            }
        }
    }

    let render_row = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
            .collect();
        format!("{}\n", padded.join("   ").trim_end())
    };

    let mut out = render_row(headers.to_vec());
    for row in rows {
        out.push_str(&render_row(row.iter().map(String::as_str).collect()));
    }
    out
}

pub fn format_workflow(wf: &Workflow) -> String {
    let mut out = String::new();
    field(&mut out, "Name", wf.name());
    field(&mut out, "Namespace", wf.namespace());
    field(&mut out, "UID", wf.uid());
    field(&mut out, "Status", wf.phase());
    if let Some(ref message) = wf.status.message {
        field(&mut out, "Message", message);
    }
    field(&mut out, "Created", timestamp(wf.metadata.created_at));
    field(&mut out, "Started", timestamp(wf.status.started_at));
    field(&mut out, "Finished", timestamp(wf.status.finished_at));
    if let Some(d) = wf.duration() {
        field(&mut out, "Duration", format_duration(d));
    }
    field(&mut out, "Entrypoint", &wf.spec.entrypoint);
    field(&mut out, "Parameters", pairs(&wf.spec.parameters));
    field(&mut out, "Labels", pairs(&wf.metadata.labels));

    let rows: Vec<Vec<String>> = wf
        .spec
        .nodes
        .iter()
        .filter_map(|n| wf.node(&n.name))
        .map(|node| {
            vec![
                node.name.clone(),
                node.phase.to_string(),
                node.attempt.to_string(),
                node.message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    if !rows.is_empty() {
        out.push('\n');
        out.push_str(&render_table(&["STEP", "PHASE", "ATTEMPT", "MESSAGE"], &rows));
    }
    out
}

pub fn format_workflow_table(wfs: &[Workflow], now: DateTime<Utc>) -> String {
    if wfs.is_empty() {
        return "No workflows found\n".to_string();
    }
    let rows: Vec<Vec<String>> = wfs
        .iter()
        .map(|wf| {
            vec![
                wf.name().to_string(),
                wf.namespace().to_string(),
                wf.phase().to_string(),
                age(wf.metadata.created_at, now),
                wf.duration().map(format_duration).unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();
    render_table(&["NAME", "NAMESPACE", "STATUS", "AGE", "DURATION"], &rows)
}

pub fn format_template(template: &WorkflowTemplate) -> String {
    let mut out = String::new();
    field(&mut out, "Name", &template.metadata.name);
    field(&mut out, "Namespace", &template.metadata.namespace);
    field(&mut out, "Created", timestamp(template.metadata.created_at));
    field(
        &mut out,
        "Entrypoint",
        template.spec.entrypoint.as_deref().unwrap_or("-"),
    );
    let params: Vec<String> = template
        .spec
        .parameters
        .iter()
        .map(|p| match p.default {
            Some(ref d) => format!("{}={}", p.name, d),
            None => p.name.clone(),
        })
        .collect();
    field(
        &mut out,
        "Parameters",
        if params.is_empty() { "-".to_string() } else { params.join(",") },
    );
    let steps: Vec<&str> = template.spec.steps.iter().map(|s| s.name.as_str()).collect();
    field(&mut out, "Steps", steps.join(","));
    out
}

pub fn format_template_table(templates: &[WorkflowTemplate], now: DateTime<Utc>) -> String {
    if templates.is_empty() {
        return "No workflow templates found\n".to_string();
    }
    let rows: Vec<Vec<String>> = templates
        .iter()
        .map(|t| {
            vec![
                t.metadata.name.clone(),
                t.metadata.namespace.clone(),
                t.spec.steps.len().to_string(),
                age(t.metadata.created_at, now),
            ]
        })
        .collect();
    render_table(&["NAME", "NAMESPACE", "STEPS", "AGE"], &rows)
}

pub fn format_cron(cron: &CronWorkflow) -> String {
    let mut out = String::new();
    field(&mut out, "Name", &cron.metadata.name);
    field(&mut out, "Namespace", &cron.metadata.namespace);
    field(&mut out, "Created", timestamp(cron.metadata.created_at));
    field(&mut out, "Schedule", &cron.spec.schedule);
    field(&mut out, "Suspended", cron.spec.suspend);
    field(
        &mut out,
        "StartingDeadlineSeconds",
        cron.spec
            .starting_deadline_seconds
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    field(&mut out, "ConcurrencyPolicy", cron.spec.concurrency_policy);
    field(
        &mut out,
        "LastScheduledTime",
        timestamp(cron.status.last_scheduled_time),
    );
    if !cron.status.active.is_empty() {
        let names: Vec<&str> = cron.status.active.iter().map(|a| a.name.as_str()).collect();
        field(&mut out, "Active Workflows", names.join(","));
    }
    out
}

pub fn format_cron_table(crons: &[CronWorkflow], now: DateTime<Utc>) -> String {
    if crons.is_empty() {
        return "No cron workflows found\n".to_string();
    }
    let rows: Vec<Vec<String>> = crons
        .iter()
        .map(|c| {
            vec![
                c.metadata.name.clone(),
                c.metadata.namespace.clone(),
                age(c.metadata.created_at, now),
                age(c.status.last_scheduled_time, now),
                c.spec.schedule.clone(),
                c.spec.suspend.to_string(),
                c.spec.concurrency_policy.to_string(),
            ]
        })
        .collect();
    render_table(
        &["NAME", "NAMESPACE", "AGE", "LAST RUN", "SCHEDULE", "SUSPENDED", "POLICY"],
        &rows,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ConcurrencyPolicy, NodeSpec, ObjectMeta, Phase, ResolvedSpec, StepTemplate, WorkflowSpec,
    };
    use std::collections::BTreeMap;

    fn workflow() -> Workflow {
        let mut meta = ObjectMeta::named("basic-x1y2z", "default");
        meta.uid = Some(uuid::Uuid::nil());
        let spec = ResolvedSpec {
            entrypoint: "whalesay-template".into(),
            parameters: BTreeMap::from([("message".to_string(), "TEST".to_string())]),
            nodes: vec![NodeSpec {
                name: "whalesay-template".into(),
                run: "echo TEST".into(),
                depends_on: vec![],
                retries: 0,
            }],
        };
        let mut wf = Workflow::new(meta, spec);
        wf.status.phase = Phase::Succeeded;
        wf
    }

    #[test]
    fn test_output_mode_from_str() {
        assert_eq!(OutputMode::from_str("json"), OutputMode::Json);
        assert_eq!(OutputMode::from_str("quiet"), OutputMode::Quiet);
        assert_eq!(OutputMode::from_str("console"), OutputMode::Console);
        assert_eq!(OutputMode::from_str("unknown"), OutputMode::Console);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(500)), "500ms");
        assert_eq!(format_duration(chrono::Duration::milliseconds(2500)), "2.5s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m5s");
    }

    #[test]
    fn test_format_workflow_block() {
        let out = format_workflow(&workflow());
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("Name:"));
        assert!(lines[0].ends_with("basic-x1y2z"));
        assert!(out.contains("Namespace:"));
        assert!(out.lines().any(|l| l.starts_with("Status:") && l.ends_with("Succeeded")));
        assert!(out.contains("Created:"));
        assert!(out.contains("message=TEST"));
        assert!(out.contains("STEP"));
    }

    #[test]
    fn test_render_table_pads_columns() {
        let out = render_table(
            &["NAME", "STATUS"],
            &[
                vec!["a-very-long-name".into(), "Running".into()],
                vec!["b".into(), "Failed".into()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        let col = lines[0].find("STATUS").unwrap();
        assert_eq!(lines[1].find("Running").unwrap(), col);
        assert_eq!(lines[2].find("Failed").unwrap(), col);
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(format_workflow_table(&[], Utc::now()), "No workflows found\n");
        assert_eq!(format_cron_table(&[], Utc::now()), "No cron workflows found\n");
    }

    #[test]
    fn test_format_cron_fields() {
        let cron = CronWorkflow::new(
            "nightly",
            "default",
            "@daily",
            WorkflowSpec {
                entrypoint: Some("main".into()),
                parameters: vec![],
                steps: vec![StepTemplate::new("main", "true")],
            },
        )
        .with_policy(ConcurrencyPolicy::Forbid)
        .with_starting_deadline(60);

        let out = format_cron(&cron);
        assert!(out.lines().any(|l| l.starts_with("Schedule:") && l.ends_with("@daily")));
        assert!(out.lines().any(|l| l.starts_with("Suspended:") && l.ends_with("false")));
        assert!(out.lines().any(|l| l.starts_with("StartingDeadlineSeconds:") && l.ends_with("60")));
        assert!(out.lines().any(|l| l.starts_with("ConcurrencyPolicy:") && l.ends_with("Forbid")));
        assert!(out.starts_with("Name:                nightly\n"));
    }

    #[test]
    fn test_format_cron_without_deadline() {
        let cron = CronWorkflow::new(
            "nightly",
            "default",
            "@daily",
            WorkflowSpec {
                entrypoint: Some("main".into()),
                parameters: vec![],
                steps: vec![StepTemplate::new("main", "true")],
            },
        );

        let out = format_cron(&cron);
        assert!(out.lines().any(|l| l == "StartingDeadlineSeconds: -"));
        assert!(out.lines().any(|l| l == "LastScheduledTime:   -"));
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(chrono::Duration::seconds(-5)), "0s");
        assert_eq!(format_age(chrono::Duration::seconds(45)), "45s");
        assert_eq!(format_age(chrono::Duration::seconds(125)), "2m");
        assert_eq!(format_age(chrono::Duration::hours(3)), "3h");
        assert_eq!(format_age(chrono::Duration::days(2)), "2d");
    }

    #[test]
    fn test_list_tables_show_age() {
        let now = Utc::now();
        let mut wf = workflow();
        wf.metadata.created_at = Some(now - chrono::Duration::minutes(5));
        let out = format_workflow_table(&[wf], now);
        let header = out.lines().next().unwrap();
        assert!(header.contains("AGE"));
        assert!(header.contains("DURATION"));
        assert!(out.lines().nth(1).unwrap().contains("5m"));

        let mut cron = CronWorkflow::new(
            "nightly",
            "default",
            "@daily",
            WorkflowSpec {
                entrypoint: Some("main".into()),
                parameters: vec![],
                steps: vec![StepTemplate::new("main", "true")],
            },
        );
        cron.metadata.created_at = Some(now - chrono::Duration::days(3));
        cron.status.last_scheduled_time = Some(now - chrono::Duration::hours(2));
        let out = format_cron_table(&[cron], now);
        let lines: Vec<&str> = out.lines().collect();
        for column in ["NAME", "AGE", "LAST RUN", "SCHEDULE", "SUSPENDED"] {
            assert!(lines[0].contains(column), "missing {column}");
        }
        assert!(lines[1].contains("3d"));
        assert!(lines[1].contains("2h"));
    }
}
