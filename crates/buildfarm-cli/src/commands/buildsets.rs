//! Buildset commands.

use anyhow::{Result, bail};
use buildfarm_core::{BuildRequestId, SourceStamp};
use buildfarm_db::SourceStampRepo;
use buildfarm_scheduler::BuildSetRequest;

pub struct SubmitArgs {
    pub builders: Vec<String>,
    pub repository: String,
    pub codebase: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub reason: String,
    pub properties: Vec<String>,
    pub triggered_by: Option<BuildRequestId>,
}

pub async fn submit(database_url: &str, config_path: &str, args: SubmitArgs) -> Result<()> {
    let (store, distributor) = super::distributor(database_url, config_path).await?;

    let stamp = SourceStamp::new(
        args.codebase,
        args.repository,
        args.branch.as_deref(),
        args.revision.as_deref(),
    );
    let ssid = store.add_sourcestamp_set(&[stamp]).await?;

    let builders: Vec<&str> = args.builders.iter().map(String::as_str).collect();
    let mut request = BuildSetRequest::new(ssid, args.reason, &builders);
    for property in &args.properties {
        let (name, value) = parse_property(property)?;
        request = request.with_property(name, value, "cli");
    }
    if let Some(parent) = args.triggered_by {
        request = request.triggered_by(parent);
    }

    let submission = distributor.submit_build_set(request).await?;

    println!("Submitted buildset {}", submission.buildset.bsid);
    for (builder, brid) in &submission.buildset.brids {
        match submission.merged.get(builder) {
            Some(target) => println!("  {:<20} {} (merged into {})", builder, brid, target),
            None => println!("  {:<20} {}", builder, brid),
        }
    }
    Ok(())
}

/// Split `name=value`. The value is read as JSON, or kept as a plain string.
fn parse_property(raw: &str) -> Result<(String, serde_json::Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("property '{}' is not of the form name=value", raw);
    };
    if name.is_empty() {
        bail!("property '{}' has an empty name", raw);
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_property_values() {
        assert_eq!(
            parse_property("priority=3").unwrap(),
            ("priority".to_string(), json!(3))
        );
        assert_eq!(
            parse_property("selected_worker=w1").unwrap(),
            ("selected_worker".to_string(), json!("w1"))
        );
        assert_eq!(
            parse_property("note=a=b").unwrap(),
            ("note".to_string(), json!("a=b"))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=1").is_err());
    }
}
