use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use hyfixes_early::{Diagnostic, TransformerPipeline, declared_class_name};
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Patched bytes for one input plus everything the report needs.
pub(crate) struct PatchOutput {
    pub(crate) bytes: Vec<u8>,
    pub(crate) artifacts: Vec<Artifact>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) class_count: usize,
    pub(crate) patched_count: usize,
}

pub(crate) fn patch_input(input: &Path, pipeline: &TransformerPipeline) -> Result<PatchOutput> {
    let extension = input.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => patch_class_file(input, pipeline),
        "jar" => patch_jar_file(input, pipeline),
        _ => anyhow::bail!("unsupported input file: {}", input.display()),
    }
}

fn analysis_target() -> Result<Vec<Value>> {
    Ok(vec![
        serde_json::to_value(ArtifactRoles::AnalysisTarget)
            .context("failed to serialize artifact role")?,
    ])
}

fn patch_class_file(path: &Path, pipeline: &TransformerPipeline) -> Result<PatchOutput> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let class_name = declared_class_name(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let result = pipeline.apply(&class_name, &data);

    let mut artifacts = Vec::new();
    push_artifact(
        path_to_uri(path),
        data.len() as u64,
        None,
        Some(analysis_target()?),
        &mut artifacts,
    );
    Ok(PatchOutput {
        patched_count: usize::from(result.applied),
        bytes: result.bytes,
        artifacts,
        diagnostics: result.diagnostics,
        class_count: 1,
    })
}

fn patch_jar_file(path: &Path, pipeline: &TransformerPipeline) -> Result<PatchOutput> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let jar_len = fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .len();
    let mut artifacts = Vec::new();
    let jar_index = push_artifact(
        path_to_uri(path),
        jar_len,
        None,
        Some(analysis_target()?),
        &mut artifacts,
    );

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if is_patchable_entry(&name) {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    let mut diagnostics = Vec::new();
    let mut patched: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for name in &entry_names {
        let mut entry = archive
            .by_name(name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let class_name = entry_class_name(name);
        let result = pipeline.apply(&class_name, &data);
        diagnostics.extend(result.diagnostics);
        if result.applied {
            push_artifact(
                jar_entry_uri(path, name),
                result.bytes.len() as u64,
                Some(jar_index),
                None,
                &mut artifacts,
            );
            patched.insert(name.clone(), result.bytes);
        }
    }

    let patched_count = patched.len();
    let bytes = rewrite_jar(&mut archive, &patched)
        .with_context(|| format!("failed to rewrite {}", path.display()))?;
    Ok(PatchOutput {
        bytes,
        artifacts,
        diagnostics,
        class_count: entry_names.len(),
        patched_count,
    })
}

/// Copy every entry in archive order, replacing the patched classes.
fn rewrite_jar<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    patched: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .with_context(|| format!("failed to read entry {index}"))?;
        match patched.get(entry.name()) {
            Some(bytes) => {
                let options = SimpleFileOptions::default().compression_method(entry.compression());
                let name = entry.name().to_string();
                drop(entry);
                writer
                    .start_file(name.as_str(), options)
                    .with_context(|| format!("failed to start {name}"))?;
                writer
                    .write_all(bytes)
                    .with_context(|| format!("failed to write {name}"))?;
            }
            None => {
                let name = entry.name().to_string();
                writer
                    .raw_copy_file(entry)
                    .with_context(|| format!("failed to copy {name}"))?;
            }
        }
    }
    let cursor = writer.finish().context("failed to finish jar")?;
    Ok(cursor.into_inner())
}

/// `a/b/C$D.class` to `a.b.C$D`.
fn entry_class_name(entry_name: &str) -> String {
    entry_name
        .strip_suffix(".class")
        .unwrap_or(entry_name)
        .replace('/', ".")
}

fn push_artifact(
    uri: String,
    len: u64,
    parent_index: Option<i64>,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
) -> i64 {
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = match (parent_index, roles) {
        (Some(parent_index), Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .roles(roles)
            .build(),
        (Some(parent_index), None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .build(),
        (None, Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        (None, None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .build(),
    };
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    index
}

/// Class entries other than module and package descriptors, which never
/// name a patch target and are not valid binary names.
fn is_patchable_entry(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.ends_with("package-info.class")
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}
