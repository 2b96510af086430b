use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;

use annoq_data::JobSummary;

fn send(client: &Client, request: RequestBuilder) -> String {
    let request = match request.build() {
        Ok(request) => request,
        Err(e) => return format!("error building request: {}", e),
    };
    match client.execute(request) {
        Ok(response) => {
            let code = response.status();
            match response.json::<Value>() {
                Ok(body) => render(code.as_u16(), &body),
                Err(e) => format!("unexpected response ({}): {}", code, e),
            }
        }
        Err(e) => format!("error executing request: {}", e),
    }
}

fn render(code: u16, body: &Value) -> String {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("(no message)");
    let mut lines = vec![format!("{} {}", code, message)];
    if let Some(info) = body.get("info").and_then(Value::as_str) {
        lines.push(format!("  info: {}", info));
    }
    if let Some(job) = body.get("job") {
        if let Ok(summary) = serde_json::from_value::<JobSummary>(job.clone()) {
            lines.push(render_summary(&summary));
        }
    }
    if let Some(jobs) = body.get("jobs").and_then(Value::as_array) {
        for job in jobs {
            if let Ok(summary) = serde_json::from_value::<JobSummary>(job.clone()) {
                lines.push(render_summary(&summary));
            }
        }
    }
    if let Some(tool_output) = body.get("tool_output").and_then(Value::as_str) {
        if !tool_output.is_empty() {
            lines.push(format!("  tool output: {}", tool_output));
        }
    }
    lines.join("\n")
}

fn render_summary(summary: &JobSummary) -> String {
    let mut line = format!(
        "  {}: {} ({})",
        summary.corpus_id,
        summary.status.name(),
        summary.description
    );
    if let Some(progress) = &summary.progress {
        line.push_str(&format!(", progress {}", progress));
    }
    if summary.seconds_taken > 0.0 {
        line.push_str(&format!(", {:.0}s", summary.seconds_taken));
    }
    if let Some(priority) = summary.priority {
        line.push_str(&format!(", queue position {}", priority));
    }
    if !summary.warnings.is_empty() {
        line.push_str(&format!("\n  warnings:\n{}", indent(&summary.warnings)));
    }
    if !summary.errors.is_empty() {
        line.push_str(&format!("\n  errors:\n{}", indent(&summary.errors)));
    }
    line
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn run(
    client: &Client,
    url: &str,
    corpus_id: &str,
    exports: Option<String>,
    files: Option<String>,
) -> String {
    let mut request = client.put(format!("{}/jobs/{}/run", url, corpus_id));
    if let Some(exports) = exports {
        request = request.query(&[("exports", exports)]);
    }
    if let Some(files) = files {
        request = request.query(&[("files", files)]);
    }
    send(client, request)
}

pub fn install(client: &Client, url: &str, corpus_id: &str, scramble: bool) -> String {
    send(
        client,
        client
            .put(format!("{}/jobs/{}/install", url, corpus_id))
            .query(&[("scramble", scramble)]),
    )
}

pub fn status(client: &Client, url: &str, corpus_id: &str) -> String {
    send(client, client.get(format!("{}/jobs/{}", url, corpus_id)))
}

pub fn list(client: &Client, url: &str) -> String {
    send(client, client.get(format!("{}/jobs", url)))
}

pub fn abort(client: &Client, url: &str, corpus_id: &str) -> String {
    send(client, client.post(format!("{}/jobs/{}/abort", url, corpus_id)))
}

pub fn remove(client: &Client, url: &str, corpus_id: &str, force: bool) -> String {
    send(
        client,
        client
            .delete(format!("{}/jobs/{}", url, corpus_id))
            .query(&[("force", force)]),
    )
}

pub fn clean(client: &Client, url: &str, corpus_id: &str, exports_only: bool) -> String {
    let path = if exports_only { "exports" } else { "annotations" };
    send(client, client.delete(format!("{}/jobs/{}/{}", url, corpus_id, path)))
}

pub fn advance(client: &Client, url: &str) -> String {
    send(client, client.put(format!("{}/advance-queue", url)))
}
