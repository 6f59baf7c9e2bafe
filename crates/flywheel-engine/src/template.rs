//! Launch templates: `{Field}` substitution over a small fixed vocabulary.
//!
//! A template is plain text; after substitution the first non-blank line is
//! the executable and every following non-blank line is one argv element.
//! MPI launches are the main customer: the template wraps the model argv in
//! the site's `mpiexec` incantation.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

/// The file-name suffix of launch templates.
pub const TEMPLATE_SUFFIX: &str = ".template.txt";

/// The fallback MPI template name, used when no model-specific template
/// exists.
pub const DEFAULT_MPI_TEMPLATE: &str = "mpi.ModelRun.template.txt";

/// The substitution input for one launch.
///
/// `args` and `env` expand to one rendered line per element, so each becomes
/// its own argv entry; `env` entries render as `KEY=value`.
#[derive(Debug, Clone, Default)]
pub struct LaunchInput {
    /// The model name.
    pub model_name: String,
    /// The executable file stem.
    pub exe_stem: String,
    /// The working directory.
    pub dir: String,
    /// The model binary directory.
    pub bin_dir: String,
    /// The model database path.
    pub db_path: String,
    /// The number of MPI processes.
    pub mpi_np: u32,
    /// The model argument vector.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

/// A rendered launch: the executable and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLaunch {
    /// The executable.
    pub exe: PathBuf,
    /// The argument vector.
    pub args: Vec<String>,
}

/// Renders template text with the given input.
///
/// Fails when the result has no non-blank lines, which would leave nothing to
/// execute.
pub fn render(text: &str, input: &LaunchInput) -> Result<RenderedLaunch> {
    let rendered = substitute(text, input);

    let mut lines = rendered
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    let Some(exe) = lines.next() else {
        bail!("template renders to no executable line");
    };

    Ok(RenderedLaunch {
        exe: PathBuf::from(exe),
        args: lines.map(str::to_string).collect(),
    })
}

/// Renders a template file with the given input.
pub fn render_file(path: &Path, input: &LaunchInput) -> Result<RenderedLaunch> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read launch template `{}`", path.display()))?;
    render(&text, input)
        .with_context(|| format!("launch template `{}` is not usable", path.display()))
}

/// Replaces every `{Field}` token with its value.
fn substitute(text: &str, input: &LaunchInput) -> String {
    let env_lines = input
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n");

    text.replace("{ModelName}", &input.model_name)
        .replace("{ExeStem}", &input.exe_stem)
        .replace("{Dir}", &input.dir)
        .replace("{BinDir}", &input.bin_dir)
        .replace("{DbPath}", &input.db_path)
        .replace("{MpiNp}", &input.mpi_np.to_string())
        .replace("{Args}", &input.args.join("\n"))
        .replace("{Env}", &env_lines)
}

/// Resolves the template file for an MPI launch.
///
/// An explicit request name wins; otherwise `mpi.<ModelName>.template.txt` is
/// preferred over the generic [`DEFAULT_MPI_TEMPLATE`].
pub fn find_mpi_template(
    etc_dir: &Path,
    model_name: &str,
    requested: Option<&str>,
) -> Result<PathBuf> {
    if let Some(name) = requested {
        let path = etc_dir.join(name);
        if !path.is_file() {
            bail!("requested launch template `{name}` not found");
        }
        return Ok(path);
    }

    for name in [
        format!("mpi.{model_name}{TEMPLATE_SUFFIX}"),
        DEFAULT_MPI_TEMPLATE.to_string(),
    ] {
        let path = etc_dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    bail!(
        "no MPI launch template for model `{model_name}` under `{}`",
        etc_dir.display()
    )
}

/// Dry-renders every template under the templates directory with a dummy
/// input.
///
/// Run at startup so a broken template fails configuration instead of the
/// first MPI submit. A missing directory is fine when no MPI run ever needs
/// a template.
pub fn validate_all(etc_dir: &Path) -> Result<()> {
    if !etc_dir.is_dir() {
        return Ok(());
    }

    let dummy = LaunchInput {
        model_name: "ModelRun".into(),
        exe_stem: "ModelRun".into(),
        dir: "/tmp".into(),
        bin_dir: "/tmp".into(),
        db_path: "/tmp/ModelRun.sqlite".into(),
        mpi_np: 2,
        args: vec!["-OpenM.RunStamp".into(), "dummy".into()],
        env: BTreeMap::new(),
    };

    for entry in std::fs::read_dir(etc_dir)
        .with_context(|| format!("failed to read templates directory `{}`", etc_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let is_template = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TEMPLATE_SUFFIX));

        if entry.file_type()?.is_file() && is_template {
            render_file(&path, &dummy)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const MPIEXEC_TEMPLATE: &str = "\
mpiexec
-n
{MpiNp}
{BinDir}/{ExeStem}
{Args}
";

    fn input() -> LaunchInput {
        LaunchInput {
            model_name: "RiskPaths".into(),
            exe_stem: "RiskPaths".into(),
            dir: "/work".into(),
            bin_dir: "/models/bin".into(),
            db_path: "/models/bin/RiskPaths.sqlite".into(),
            mpi_np: 4,
            args: vec!["-OpenM.RunStamp".into(), "2024_03_05_10_00_00_000".into()],
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn renders_exe_and_one_arg_per_line() {
        let launch = render(MPIEXEC_TEMPLATE, &input()).unwrap();
        assert_eq!(launch.exe, PathBuf::from("mpiexec"));
        assert_eq!(
            launch.args,
            [
                "-n",
                "4",
                "/models/bin/RiskPaths",
                "-OpenM.RunStamp",
                "2024_03_05_10_00_00_000",
            ]
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        let launch = render("\n\n  mpiexec  \n\n{ExeStem}\n\n", &input()).unwrap();
        assert_eq!(launch.exe, PathBuf::from("mpiexec"));
        assert_eq!(launch.args, ["RiskPaths"]);
    }

    #[test]
    fn env_expands_to_assignments() {
        let mut input = input();
        input.env.insert("OMP_NUM_THREADS".into(), "2".into());
        input.env.insert("A".into(), "b".into());

        let launch = render("runner\n{Env}\n", &input).unwrap();
        assert_eq!(launch.args, ["A=b", "OMP_NUM_THREADS=2"]);
    }

    #[test]
    fn empty_render_is_an_error() {
        assert!(render("\n   \n{Args}\n", &LaunchInput::default()).is_err());
    }

    #[test]
    fn model_template_preferred_over_default() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("mpi.RiskPaths.template.txt");
        let generic = tmp.path().join(DEFAULT_MPI_TEMPLATE);
        std::fs::write(&model, "mpiexec\n{Args}\n").unwrap();
        std::fs::write(&generic, "mpiexec\n{Args}\n").unwrap();

        let found = find_mpi_template(tmp.path(), "RiskPaths", None).unwrap();
        assert_eq!(found, model);

        let found = find_mpi_template(tmp.path(), "OtherModel", None).unwrap();
        assert_eq!(found, generic);

        let explicit =
            find_mpi_template(tmp.path(), "RiskPaths", Some(DEFAULT_MPI_TEMPLATE)).unwrap();
        assert_eq!(explicit, generic);

        assert!(find_mpi_template(tmp.path(), "RiskPaths", Some("missing.txt")).is_err());
    }

    #[test]
    fn validation_flags_empty_template() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mpi.Ok.template.txt"), "mpiexec\n{Args}\n").unwrap();
        assert!(validate_all(tmp.path()).is_ok());

        std::fs::write(tmp.path().join("mpi.Bad.template.txt"), "\n \n").unwrap();
        assert!(validate_all(tmp.path()).is_err());

        // a directory that does not exist is not an error
        assert!(validate_all(&tmp.path().join("missing")).is_ok());
    }
}
