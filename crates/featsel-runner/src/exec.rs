//! Turns a job's stored options into a JVM command line and a Grid Engine
//! submission script.

use featsel_core::{bool_flag, parse_bool_flag, parse_memory, sha256_file, SettingsStore};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub(crate) const KEY_JAR: &str = "jar";
pub(crate) const KEY_JAR_DIGEST: &str = "jar-sha256";
pub(crate) const KEY_MAIN_CLASS: &str = "main_class";
pub(crate) const KEY_CLASS_PATH: &str = "class_path";
pub(crate) const KEY_XMX: &str = "xmx";
pub(crate) const KEY_PROFILE: &str = "profile";
pub(crate) const KEY_ASSERTS: &str = "asserts";
pub(crate) const KEY_MEM_FREE: &str = "mem_free";
pub(crate) const KEY_RUNTIME: &str = "h_rt";
pub(crate) const KEY_NOTIFY: &str = "notify_email";

/// Everything needed to launch one evaluation on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSpec {
    pub jar: Option<PathBuf>,
    pub main_class: String,
    pub class_path: Vec<String>,
    pub args: Vec<String>,
    #[serde(deserialize_with = "memory_text")]
    pub xmx: String,
    #[serde(deserialize_with = "memory_text")]
    pub mem_free: String,
    pub runtime_limit_hours: u32,
    pub profile: bool,
    pub asserts: bool,
    /// Passed as `-D<key>=<value>`.
    pub java_options: BTreeMap<String, String>,
    pub notify_email: Option<String>,
}

impl Default for ExecutionSpec {
    fn default() -> Self {
        Self {
            jar: None,
            main_class: String::new(),
            class_path: Vec::new(),
            args: Vec::new(),
            xmx: "2G".to_string(),
            mem_free: "3G".to_string(),
            runtime_limit_hours: 72,
            profile: false,
            asserts: true,
            java_options: BTreeMap::new(),
            notify_email: None,
        }
    }
}

impl ExecutionSpec {
    /// Adds a jar, or every jar below a directory, to the class path.
    pub fn add_lib(&mut self, path: &Path) -> Result<()> {
        if path.is_file() {
            self.class_path.push(path.to_string_lossy().to_string());
            return Ok(());
        }
        if !path.is_dir() {
            return Err(Error::Config(format!(
                "library path {} is neither a file nor a directory",
                path.display()
            )));
        }
        let mut jars = Vec::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Config(format!("cannot walk {}: {}", path.display(), e)))?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("jar")
            {
                jars.push(entry.path().to_string_lossy().to_string());
            }
        }
        self.class_path.extend(jars);
        Ok(())
    }

    /// Writes these options into a job's stores. Memory strings are normalised here
    /// so a bad request fails before anything is submitted.
    pub(crate) fn store_into(
        &self,
        meta: &mut SettingsStore,
        resources: &mut SettingsStore,
        exec_opts: &mut SettingsStore,
    ) -> Result<()> {
        if self.main_class.trim().is_empty() {
            return Err(Error::Config("main_class is required".to_string()));
        }
        let xmx = parse_memory(&self.xmx)?;
        let mem_free = parse_memory(&self.mem_free)?;

        match &self.jar {
            Some(jar) => meta.set(KEY_JAR, jar.to_string_lossy())?,
            None => {
                meta.remove(KEY_JAR);
            }
        }
        meta.set(KEY_MAIN_CLASS, &self.main_class)?;
        meta.set(KEY_CLASS_PATH, self.class_path.join(":"))?;
        meta.set(KEY_XMX, xmx)?;
        meta.set(KEY_PROFILE, bool_flag(self.profile))?;
        meta.set(KEY_ASSERTS, bool_flag(self.asserts))?;

        resources.set(KEY_MEM_FREE, mem_free)?;
        resources.set(KEY_RUNTIME, format!("{}:00:00", self.runtime_limit_hours))?;
        match &self.notify_email {
            Some(email) => resources.set(KEY_NOTIFY, email)?,
            None => {
                resources.remove(KEY_NOTIFY);
            }
        }

        exec_opts.clear();
        for (k, v) in &self.java_options {
            exec_opts.set(k, v)?;
        }
        Ok(())
    }
}

/// Memory requests may be written as text (`"512M"`) or as a bare number of
/// gigabytes (`4`, `1.5`).
fn memory_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Whole(u64),
        Fraction(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Whole(n) => n.to_string(),
        Raw::Fraction(f) => f.to_string(),
    })
}

fn required<'a>(store: &'a SettingsStore, key: &str) -> Result<&'a str> {
    store
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "missing required option {} in {}",
                key,
                store.path().display()
            ))
        })
}

fn flag(store: &SettingsStore, key: &str, default: bool) -> Result<bool> {
    match store.get(key) {
        None => Ok(default),
        Some(v) => parse_bool_flag(v)
            .ok_or_else(|| Error::Config(format!("{} must be y or n, got {:?}", key, v))),
    }
}

/// Builds the JVM invocation. Records the jar digest in `meta` when a jar is set.
pub(crate) fn java_command(
    meta: &mut SettingsStore,
    exec_opts: &SettingsStore,
    args: &[String],
) -> Result<String> {
    let main_class = required(meta, KEY_MAIN_CLASS)?.to_string();
    let class_path = meta.get(KEY_CLASS_PATH).unwrap_or("").to_string();
    let mut parts: Vec<String> = vec!["java".to_string()];

    if let Some(xmx) = meta.get(KEY_XMX) {
        parts.push(format!("-Xmx{}", xmx));
    }
    if let Some(jar) = meta.get(KEY_JAR).map(PathBuf::from) {
        if !jar.is_file() {
            return Err(Error::Config(format!(
                "jar {} is not a file",
                jar.display()
            )));
        }
        let digest = sha256_file(&jar).map_err(Error::io(&jar))?;
        meta.set(KEY_JAR_DIGEST, digest)?;
        parts.push(format!("-jar {}", shell_quote(&jar.to_string_lossy())));
    }
    if !class_path.is_empty() {
        parts.push(format!("-cp {}", shell_quote(&class_path)));
    }
    if flag(meta, KEY_ASSERTS, true)? {
        parts.push("-ea".to_string());
    }
    if flag(meta, KEY_PROFILE, false)? {
        parts.push("-agentlib:hprof=cpu=samples,depth=20,heap=sites".to_string());
    }
    for (k, v) in exec_opts.iter() {
        let key = if k.starts_with("-D") {
            k.to_string()
        } else {
            format!("-D{}", k)
        };
        parts.push(format!("{}={}", key, shell_quote(v)));
    }
    parts.push(main_class);
    parts.extend(args.iter().map(|a| shell_quote(a)));
    Ok(parts.join(" \\\n\t"))
}

/// Renders the submission script. The trailing hook appends the completion
/// marker to `meta_path` only if the command exits zero.
pub(crate) fn render_script(
    command: &str,
    resources: &SettingsStore,
    log_dir: &Path,
    meta_path: &Path,
) -> Result<String> {
    let mem_free = required(resources, KEY_MEM_FREE)?;
    let runtime = required(resources, KEY_RUNTIME)?;
    let mut out = String::new();
    out.push_str("#!/bin/sh\n");
    out.push_str("#$ -cwd\n");
    out.push_str("#$ -j y\n");
    out.push_str("#$ -V\n");
    out.push_str(&format!("#$ -l h_rt={}\n", runtime));
    out.push_str(&format!("#$ -l mem_free={}\n", mem_free));
    if let Some(email) = resources.get(KEY_NOTIFY) {
        out.push_str(&format!("#$ -M {}\n", email));
        out.push_str("#$ -m as\n");
    }
    out.push_str(&format!(
        "#$ -o {}\n",
        shell_quote(&log_dir.to_string_lossy())
    ));
    out.push_str(command);
    out.push_str(&format!(
        " \\\n\t&& printf 'finished\\t%s\\n' \"$(date '+%Y-%m-%d %H:%M:%S')\" >> {}\n",
        shell_quote(&meta_path.to_string_lossy())
    ));
    Ok(out)
}

pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
