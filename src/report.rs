use serde_json::json;
use serde_sarif::sarif::{
    Artifact, Invocation, Location, LogicalLocation, Message, MultiformatMessageString,
    ReportingDescriptor, Result as SarifResult, Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};

use crate::pipeline::{Diagnostic, Registry};

pub(crate) fn method_location(class_name: &str, method: &str) -> Location {
    let logical = method_logical_location(class_name, method);
    Location::builder().logical_locations(vec![logical]).build()
}

/// `method` is the method name, optionally followed by its descriptor.
pub(crate) fn method_logical_location(class_name: &str, method: &str) -> LogicalLocation {
    LogicalLocation::builder()
        .name(format!("{class_name}.{method}"))
        .kind("function")
        .build()
}

pub(crate) fn class_location(class_name: &str) -> Location {
    let logical = LogicalLocation::builder()
        .name(class_name)
        .kind("type")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

/// One SARIF result per transformer invocation.
pub fn diagnostic_result(diagnostic: &Diagnostic) -> SarifResult {
    let class_name = diagnostic.class_name.replace('/', ".");
    let location = match &diagnostic.method {
        Some(method) => method_location(&class_name, method),
        None => class_location(&class_name),
    };
    let message = result_message(format!(
        "{}: {}",
        diagnostic.outcome.as_str(),
        diagnostic.message
    ));
    SarifResult::builder()
        .rule_id(diagnostic.transformer.clone())
        .message(message)
        .locations(vec![location])
        .build()
}

/// SARIF rule per registered transformer, described by the defect
/// signatures its rewriters look for.
pub fn transformer_rules(registry: &Registry) -> Vec<ReportingDescriptor> {
    registry
        .transformers()
        .iter()
        .map(|transformer| {
            let target = transformer.target();
            let mut names: Vec<&str> = Vec::new();
            let mut descriptions: Vec<String> = Vec::new();
            for pattern in transformer.patterns() {
                if !names.contains(&pattern.name) {
                    names.push(pattern.name);
                    descriptions.push(format!("{}: {}.", pattern.id, pattern.description));
                }
            }
            ReportingDescriptor::builder()
                .id(transformer.name())
                .name(format!("{}.{}", target.class_name(), target.method_name()))
                .short_description(description_text(names.join(", ")))
                .full_description(description_text(descriptions.join(" ")))
                .build()
        })
        .collect()
}

fn description_text(text: String) -> MultiformatMessageString {
    MultiformatMessageString::builder().text(text).build()
}

pub fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

pub fn build_sarif(
    rules: Vec<ReportingDescriptor>,
    artifacts: Vec<Artifact>,
    results: Vec<SarifResult>,
    invocation: Invocation,
) -> Sarif {
    let driver = ToolComponent::builder()
        .name("hyfixes-early")
        .version(env!("CARGO_PKG_VERSION"))
        .rules(rules)
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
