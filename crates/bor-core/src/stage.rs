//! Build directory staging
//!
//! Materializes a request on disk: the submitted sources, the harness entry
//! point and a Makefile made of the configured template followed by one link
//! rule per suite and an `all` target.

use crate::config::ServiceConfig;
use crate::protocol::{BuildRequest, HARNESS_SOURCE, HARNESS_STEM, MAKEFILE, SuiteSpec};
use crate::{BorError, Result};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::task::JoinSet;

/// Creates build directories from requests
#[derive(Debug, Clone)]
pub struct Stager {
    tmp_dir: PathBuf,
    tmp_prefix: String,
    makefile_template: PathBuf,
    harness_source: PathBuf,
}

/// A staged build directory, removed when dropped
#[derive(Debug)]
pub struct BuildDirectory {
    dir: TempDir,
}

impl BuildDirectory {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the directory tree, reporting failures
    pub async fn remove(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(io::Error::other)?
            .map_err(|e| staging(&format!("removing {}", path.display()), e))
    }
}

impl Stager {
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            tmp_dir: config.tmp_dir.clone().unwrap_or_else(std::env::temp_dir),
            tmp_prefix: config.tmp_prefix.clone(),
            makefile_template: config.makefile_template.clone(),
            harness_source: config.harness_source.clone(),
        }
    }

    /// Validate `request` and write it into a fresh build directory
    ///
    /// All file copies have finished when this returns. On error nothing is
    /// left behind.
    pub async fn stage(&self, request: BuildRequest) -> Result<BuildDirectory> {
        request.validate()?;

        let dir = tempfile::Builder::new()
            .prefix(&self.tmp_prefix)
            .tempdir_in(&self.tmp_dir)
            .map_err(|e| staging(&format!("creating directory in {}", self.tmp_dir.display()), e))?;
        let root = dir.path().to_path_buf();

        tracing::debug!(
            dir = %root.display(),
            files = request.files.len(),
            suites = request.suites.len(),
            "staging build directory"
        );

        let BuildRequest { files, suites } = request;
        let mut copies = JoinSet::new();

        for (name, content) in files {
            let path = root.join(&name);
            copies.spawn(async move {
                let written = tokio::fs::write(&path, content.into_bytes()).await;
                (name, written)
            });
        }

        let harness = self.harness_source.clone();
        let harness_dst = root.join(HARNESS_SOURCE);
        copies.spawn(async move {
            let copied = tokio::fs::copy(&harness, &harness_dst).await.map(drop);
            (harness.display().to_string(), copied)
        });

        let makefile = self.write_makefile(&root, &suites).await;

        // Every copy is joined, even after a failure, before the directory
        // can be used or removed.
        let mut failed = None;
        while let Some(joined) = copies.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(e))) => staging(&format!("writing {name}"), e),
                Err(e) => staging("file copy task", io::Error::other(e)),
            };
            failed.get_or_insert(err);
        }

        makefile?;
        if let Some(err) = failed {
            return Err(err);
        }
        Ok(BuildDirectory { dir })
    }

    async fn write_makefile(&self, root: &Path, suites: &[SuiteSpec]) -> Result<()> {
        let mut script = tokio::fs::read(&self.makefile_template)
            .await
            .map_err(|e| staging(&format!("reading {}", self.makefile_template.display()), e))?;
        if !script.is_empty() && !script.ends_with(b"\n") {
            script.push(b'\n');
        }
        script.extend_from_slice(makefile_rules(suites).as_bytes());

        tokio::fs::write(root.join(MAKEFILE), script)
            .await
            .map_err(|e| staging("writing Makefile", e))
    }
}

/// Link rules for every suite plus the `all` target, in request order
#[must_use]
pub fn makefile_rules(suites: &[SuiteSpec]) -> String {
    let mut rules = String::new();
    for suite in suites {
        let objects = suite
            .link
            .iter()
            .map(|m| format!("{m}.o"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(rules, "{}: {HARNESS_STEM}.o {objects}", suite.name);
        let _ = writeln!(
            rules,
            "\t$(CXX) $(CXXFLAGS) $(LDFLAGS) -o {} {objects} {HARNESS_STEM}.o\n",
            suite.name
        );
    }
    let names = suites
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(rules, "all: {names}");
    rules
}

fn staging(context: &str, err: io::Error) -> BorError {
    BorError::Staging(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileContent;
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        _root: TempDir,
        parent: PathBuf,
        stager: Stager,
    }

    fn fixture(template: &str) -> Fixture {
        let root = tempdir().unwrap();
        let parent = root.path().join("builds");
        fs::create_dir(&parent).unwrap();
        fs::write(root.path().join("Makefile.tpl"), template).unwrap();
        fs::write(root.path().join("harness.cpp"), "int main() {}\n").unwrap();

        let config = ServiceConfig::builder()
            .listen("127.0.0.1:0")
            .tmp_dir(&parent)
            .tmp_prefix("stage-test-")
            .makefile_template(root.path().join("Makefile.tpl"))
            .harness_source(root.path().join("harness.cpp"))
            .build();
        Fixture {
            stager: Stager::from_config(&config),
            parent,
            _root: root,
        }
    }

    fn request() -> BuildRequest {
        let mut files = std::collections::BTreeMap::new();
        files.insert("add.cpp".into(), FileContent::from_bytes(b"int add();\n".to_vec()));
        files.insert("add.h".into(), FileContent::from_bytes(b"#pragma once\n".to_vec()));
        files.insert("test_add.cpp".into(), FileContent::from_bytes(b"// t\n".to_vec()));
        BuildRequest {
            files,
            suites: vec![
                SuiteSpec::new("unit", ["add", "test_add"]),
                SuiteSpec::new("smoke", ["add"]),
            ],
        }
    }

    #[test]
    fn rules_follow_request_order() {
        let rules = makefile_rules(&request().suites);
        assert_eq!(
            rules,
            "unit: TAPListener.o add.o test_add.o\n\
             \t$(CXX) $(CXXFLAGS) $(LDFLAGS) -o unit add.o test_add.o TAPListener.o\n\n\
             smoke: TAPListener.o add.o\n\
             \t$(CXX) $(CXXFLAGS) $(LDFLAGS) -o smoke add.o TAPListener.o\n\n\
             all: unit smoke\n"
        );
    }

    #[tokio::test]
    async fn stages_sources_harness_and_makefile() {
        let fx = fixture("CXX = c++\n%.o: %.cpp\n\t$(CXX) -c $<");
        let dir = fx.stager.stage(request()).await.unwrap();
        let path = dir.path().to_path_buf();

        assert!(path.starts_with(&fx.parent));
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("stage-test-")
        );
        assert_eq!(fs::read(path.join("add.cpp")).unwrap(), b"int add();\n");
        assert_eq!(fs::read(path.join("add.h")).unwrap(), b"#pragma once\n");
        assert_eq!(
            fs::read_to_string(path.join("TAPListener.cpp")).unwrap(),
            "int main() {}\n"
        );

        let makefile = fs::read_to_string(path.join("Makefile")).unwrap();
        assert!(makefile.starts_with("CXX = c++\n%.o: %.cpp\n\t$(CXX) -c $<\nunit: "));
        assert!(makefile.ends_with("all: unit smoke\n"));

        dir.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_removes_directory() {
        let fx = fixture("");
        let dir = fx.stager.stage(request()).await.unwrap();
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn invalid_request_creates_nothing() {
        let fx = fixture("");
        let mut req = request();
        req.suites.push(SuiteSpec::new("broken", ["missing"]));

        let err = fx.stager.stage(req).await.unwrap_err();
        assert!(matches!(err, BorError::InvalidRequest(_)));
        assert_eq!(fs::read_dir(&fx.parent).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_harness_cleans_up() {
        let mut fx = fixture("");
        fx.stager.harness_source = PathBuf::from("/nonexistent/harness.cpp");

        let err = fx.stager.stage(request()).await.unwrap_err();
        assert!(matches!(err, BorError::Staging(msg) if msg.contains("/nonexistent/harness.cpp")));
        assert_eq!(fs::read_dir(&fx.parent).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_template_cleans_up() {
        let mut fx = fixture("");
        fx.stager.makefile_template = PathBuf::from("/nonexistent/Makefile.tpl");

        let err = fx.stager.stage(request()).await.unwrap_err();
        assert!(matches!(err, BorError::Staging(_)));
        assert_eq!(fs::read_dir(&fx.parent).unwrap().count(), 0);
    }
}
