//! Adapter around the Marlin reconstruction engine.
//!
//! A [`Marlin`] instance holds the parsed steering template plus the
//! overrides accumulated by the calibration steps (global parameters,
//! processor parameters, input files, an optional processor run-list).
//! The template itself is never mutated: every [`Marlin::run`] renders a
//! fresh snapshot from template + overrides into a transient steering
//! file and hands that to the engine, so no state can leak between
//! iterations.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use calo_calib_core::{process, CalibrationDocument, Element};

const DEFAULT_VERBOSITY: &str = "MESSAGE";
const DEFAULT_RANDOM_SEED: i64 = 1234567890;

/// The reconstruction engine with its steering template and overrides.
#[derive(Debug, Clone)]
pub struct Marlin {
    executable: String,
    template: Element,
    globals: Vec<(String, String)>,
    overrides: Vec<(String, String, String)>,
    input_files: Vec<String>,
    run_processors: Option<Vec<String>>,
    geometry_processor: String,
    gear_source: Option<PathBuf>,
}

impl Marlin {
    /// Parse a steering file, splicing `<include ref="..."/>` elements
    /// (paths resolved relative to the including file).
    pub fn from_steering_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut template = Element::load(path)
            .with_context(|| format!("loading steering file '{}'", path.display()))?;
        if template.name() != "marlin" {
            bail!(
                "steering file '{}' has root '{}', expected 'marlin'",
                path.display(),
                template.name()
            );
        }
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        resolve_includes(&mut template, &base_dir)?;

        let mut marlin = Self {
            executable: "Marlin".to_string(),
            template,
            globals: Vec::new(),
            overrides: Vec::new(),
            input_files: Vec::new(),
            run_processors: None,
            geometry_processor: "InitDD4hep".to_string(),
            gear_source: None,
        };
        marlin.set_verbosity(DEFAULT_VERBOSITY);
        marlin.set_max_record_number(0);
        marlin.set_skip_events(0);
        marlin.set_random_seed(DEFAULT_RANDOM_SEED);
        Ok(marlin)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Override a processor parameter for subsequent runs.
    ///
    /// # Errors
    ///
    /// When the steering template defines no such parameter.
    pub fn set_processor_parameter(
        &mut self,
        processor: &str,
        parameter: &str,
        value: impl ToString,
    ) -> Result<()> {
        if !self.has_processor_parameter(processor, parameter) {
            bail!("steering file defines no parameter '{parameter}' for processor '{processor}'");
        }
        let value = value.to_string();
        match self
            .overrides
            .iter_mut()
            .find(|(p, n, _)| p == processor && n == parameter)
        {
            Some(slot) => slot.2 = value,
            None => self
                .overrides
                .push((processor.to_string(), parameter.to_string(), value)),
        }
        Ok(())
    }

    /// Whether the steering template defines the given parameter.
    pub fn has_processor_parameter(&self, processor: &str, parameter: &str) -> bool {
        parameter_element(&self.template, processor, parameter).is_some()
    }

    /// Current value of a processor parameter: pending override first,
    /// then the template.
    pub fn processor_parameter(&self, processor: &str, parameter: &str) -> Result<String> {
        if let Some((_, _, value)) = self
            .overrides
            .iter()
            .find(|(p, n, _)| p == processor && n == parameter)
        {
            return Ok(value.clone());
        }
        let element = parameter_element(&self.template, processor, parameter)
            .with_context(|| {
                format!("steering file defines no parameter '{parameter}' for processor '{processor}'")
            })?;
        Ok(element
            .text()
            .or_else(|| element.attribute("value"))
            .unwrap_or_default()
            .to_string())
    }

    /// Override a global steering parameter.
    pub fn set_global(&mut self, name: &str, value: impl ToString) {
        let value = value.to_string();
        match self.globals.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.globals.push((name.to_string(), value)),
        }
    }

    pub fn set_input_files(&mut self, files: Vec<String>) {
        self.input_files = files;
    }

    pub fn set_gear_file(&mut self, gear_file: &Path) {
        self.set_global("GearXMLFile", gear_file.display());
    }

    /// Point the steering at the gear file derived from the compact
    /// description and schedule the conversion for the next run. The
    /// conversion itself spawns an external process, so it is deferred
    /// out of the command-line phase.
    pub fn set_gear_from_compact(&mut self, compact_file: &Path) -> Result<()> {
        let gear_file = gear_file_name(compact_file)?;
        self.set_gear_file(&gear_file);
        self.gear_source = Some(compact_file.to_path_buf());
        Ok(())
    }

    /// Run the scheduled geometry conversion now, if any. A no-op when
    /// the gear file already exists.
    pub fn ensure_gear(&self) -> Result<()> {
        if let Some(compact_file) = &self.gear_source {
            convert_to_gear(compact_file)?;
        }
        Ok(())
    }

    /// Point the geometry processor at the compact detector description.
    pub fn set_compact_file(&mut self, compact_file: &Path) -> Result<()> {
        let processor = self.geometry_processor.clone();
        self.set_processor_parameter(&processor, "DD4hepXMLFile", compact_file.display())
    }

    pub fn set_geometry_processor(&mut self, processor: impl Into<String>) {
        self.geometry_processor = processor.into();
    }

    pub fn set_max_record_number(&mut self, count: u64) {
        self.set_global("MaxRecordNumber", count);
    }

    pub fn set_skip_events(&mut self, count: u64) {
        self.set_global("SkipNEvents", count);
    }

    pub fn set_verbosity(&mut self, verbosity: &str) {
        self.set_global("Verbosity", verbosity);
    }

    pub fn set_random_seed(&mut self, seed: i64) {
        self.set_global("RandomSeed", seed);
    }

    /// Restrict the `<execute>` section to the given processors.
    pub fn run_only(&mut self, processors: &[String]) {
        self.run_processors = Some(processors.to_vec());
    }

    /// Import every processor-bound entry of the document's input section.
    pub fn load_input_parameters(&mut self, document: &CalibrationDocument) -> Result<()> {
        for (processor, name, value) in collect_processor_entries(document.input()) {
            self.set_processor_parameter(&processor, &name, value)
                .context("importing user input parameters")?;
        }
        Ok(())
    }

    /// Import the processor-bound entries of a previous step's output.
    /// A step with no record in the document is skipped: its constants
    /// are then expected from the user input section instead.
    pub fn load_step_output(&mut self, document: &CalibrationDocument, step: &str) -> Result<()> {
        let Some(record) = document.step(step) else {
            log::info!("step '{step}' not processed yet; taking its values from user input");
            return Ok(());
        };
        for (processor, name, value) in collect_processor_entries(record.output()) {
            self.set_processor_parameter(&processor, &name, value)
                .with_context(|| format!("importing output of step '{step}'"))?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Render the steering snapshot for the current overrides.
    pub fn render(&self) -> Result<Element> {
        let mut snapshot = self.template.clone();

        let global = snapshot
            .child_mut("global")
            .context("steering file has no <global> section")?;
        let mut globals = self.globals.clone();
        if !self.input_files.is_empty() {
            globals.push(("LCIOInputFiles".to_string(), self.input_files.join(" ")));
        }
        for (name, value) in &globals {
            let parameter = global
                .children_mut()
                .iter_mut()
                .find(|child| {
                    child.name() == "parameter" && child.attribute("name") == Some(name.as_str())
                })
                .with_context(|| format!("steering file defines no global parameter '{name}'"))?;
            parameter.remove_attribute("value");
            parameter.set_text(value.clone());
        }

        for (processor, name, value) in &self.overrides {
            let parameter = parameter_element_mut(&mut snapshot, processor, name)
                .with_context(|| {
                    format!("steering file defines no parameter '{name}' for processor '{processor}'")
                })?;
            parameter.remove_attribute("value");
            parameter.set_text(value.clone());
        }

        if let Some(keep) = &self.run_processors {
            let execute = snapshot
                .child_mut("execute")
                .context("steering file has no <execute> section")?;
            restrict_execute(execute, keep);
        }

        Ok(snapshot)
    }

    /// Render the snapshot to a transient steering file and run the
    /// engine on it, blocking until it exits. The transient file is
    /// removed afterwards.
    pub fn run(&self) -> Result<()> {
        self.ensure_gear()?;
        let snapshot = self.render()?;
        let steering = tempfile::Builder::new()
            .prefix("marlin-steering-")
            .suffix(".xml")
            .tempfile()
            .context("creating transient steering file")?;
        snapshot.save(steering.path())?;
        process::run(self.executable.as_str(), &[steering.path().as_os_str()])?;
        Ok(())
    }
}

fn gear_file_name(compact_file: &Path) -> Result<PathBuf> {
    let name = compact_file
        .file_name()
        .with_context(|| format!("compact file path '{}' has no file name", compact_file.display()))?;
    Ok(PathBuf::from(format!("gear_{}", name.to_string_lossy())))
}

/// Convert the compact detector description to a gear file, reusing an
/// existing conversion when present. Returns the gear file path.
pub fn convert_to_gear(compact_file: &Path) -> Result<PathBuf> {
    let gear_file = gear_file_name(compact_file)?;
    if gear_file.is_file() {
        log::debug!("reusing existing gear file {}", gear_file.display());
        return Ok(gear_file);
    }
    let args: Vec<&OsStr> = vec![
        OsStr::new("default"),
        compact_file.as_os_str(),
        gear_file.as_os_str(),
    ];
    process::run("convertToGear", &args)
        .with_context(|| format!("converting '{}' to gear", compact_file.display()))?;
    Ok(gear_file)
}

fn collect_processor_entries(
    set: &calo_calib_core::ParameterSet,
) -> Vec<(String, String, String)> {
    set.processor_entries()
        .map(|(processor, name, value)| {
            (processor.to_string(), name.to_string(), value.to_string())
        })
        .collect()
}

fn parameter_element<'a>(
    template: &'a Element,
    processor: &str,
    parameter: &str,
) -> Option<&'a Element> {
    let direct = template
        .children_named("processor")
        .find(|p| p.attribute("name") == Some(processor));
    let grouped = template
        .children_named("group")
        .flat_map(|group| group.children_named("processor"))
        .find(|p| p.attribute("name") == Some(processor));
    direct
        .or(grouped)
        .and_then(|p| p.child_where("parameter", "name", parameter))
}

fn parameter_element_mut<'a>(
    template: &'a mut Element,
    processor: &str,
    parameter: &str,
) -> Option<&'a mut Element> {
    let mut processors: Vec<&'a mut Element> = Vec::new();
    for child in template.children_mut().iter_mut() {
        if child.name() == "processor" {
            processors.push(child);
        } else if child.name() == "group" {
            for nested in child.children_mut().iter_mut() {
                if nested.name() == "processor" {
                    processors.push(nested);
                }
            }
        }
    }
    processors
        .into_iter()
        .find(|p| p.attribute("name") == Some(processor))?
        .children_mut()
        .iter_mut()
        .find(|c| c.name() == "parameter" && c.attribute("name") == Some(parameter))
}

fn restrict_execute(execute: &mut Element, keep: &[String]) {
    for child in execute.children_mut().iter_mut() {
        if child.name() == "if" {
            restrict_execute(child, keep);
        }
    }
    execute.retain_children(|child| {
        child.name() != "processor"
            || child
                .attribute("name")
                .is_some_and(|name| keep.iter().any(|kept| kept == name))
    });
}

fn resolve_includes(element: &mut Element, base_dir: &Path) -> Result<()> {
    let children = std::mem::take(element.children_mut());
    let mut resolved = Vec::with_capacity(children.len());
    for mut child in children {
        if child.name() == "include" {
            let reference = child
                .attribute("ref")
                .context("include element without a 'ref' attribute")?;
            if !reference.ends_with(".xml") {
                bail!("include reference '{reference}' is not an xml file");
            }
            let path = if Path::new(reference).is_absolute() {
                PathBuf::from(reference)
            } else {
                base_dir.join(reference)
            };
            let mut included = Element::load(&path)
                .with_context(|| format!("loading included file '{}'", path.display()))?;
            let included_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            resolve_includes(&mut included, &included_dir)?;
            if included.name() == element.name() {
                resolved.extend(included.into_children());
            } else {
                resolved.push(included);
            }
        } else {
            resolve_includes(&mut child, base_dir)?;
            resolved.push(child);
        }
    }
    *element.children_mut() = resolved;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STEERING: &str = r#"<marlin>
  <execute>
    <processor name="InitDD4hep"/>
    <processor name="MyEcalBarrelDigi"/>
    <if condition="RunPandora">
      <processor name="MyDDMarlinPandora"/>
    </if>
    <processor name="MyPfoAnalysis"/>
  </execute>
  <global>
    <parameter name="LCIOInputFiles"> </parameter>
    <parameter name="GearXMLFile" value="gear.xml"/>
    <parameter name="MaxRecordNumber" value="0"/>
    <parameter name="SkipNEvents" value="0"/>
    <parameter name="Verbosity" value="MESSAGE"/>
    <parameter name="RandomSeed" value="1"/>
  </global>
  <processor name="InitDD4hep">
    <parameter name="DD4hepXMLFile">detector.xml</parameter>
  </processor>
  <processor name="MyEcalBarrelDigi">
    <parameter name="calibration_mip" value="0.0001"/>
  </processor>
  <group name="Reco">
    <processor name="MyEcalBarrelReco">
      <parameter name="calibration_factorsMipGev">42.91 93.81</parameter>
    </processor>
  </group>
  <processor name="MyPfoAnalysis">
    <parameter name="RootFile">PfoAnalysis.root</parameter>
  </processor>
</marlin>
"#;

    fn steering_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".xml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_template_parameters() {
        let file = steering_file(STEERING);
        let marlin = Marlin::from_steering_file(file.path()).unwrap();
        assert_eq!(
            marlin
                .processor_parameter("MyEcalBarrelDigi", "calibration_mip")
                .unwrap(),
            "0.0001"
        );
        // Parameters inside <group> sections resolve too.
        assert_eq!(
            marlin
                .processor_parameter("MyEcalBarrelReco", "calibration_factorsMipGev")
                .unwrap(),
            "42.91 93.81"
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        marlin
            .set_processor_parameter("MyEcalBarrelDigi", "calibration_mip", 0.0002)
            .unwrap();
        assert_eq!(
            marlin
                .processor_parameter("MyEcalBarrelDigi", "calibration_mip")
                .unwrap(),
            "0.0002"
        );
    }

    #[test]
    fn unknown_parameter_is_rejected_at_set_time() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        assert!(marlin
            .set_processor_parameter("NoSuchProcessor", "x", 1)
            .is_err());
        assert!(marlin
            .set_processor_parameter("MyEcalBarrelDigi", "no_such_parameter", 1)
            .is_err());
    }

    #[test]
    fn render_applies_overrides_and_globals() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        marlin.set_input_files(vec!["a.slcio".into(), "b.slcio".into()]);
        marlin.set_max_record_number(500);
        marlin
            .set_processor_parameter("MyPfoAnalysis", "RootFile", "out.root")
            .unwrap();

        let snapshot = marlin.render().unwrap();
        let global = snapshot.child("global").unwrap();
        let lcio = global
            .child_where("parameter", "name", "LCIOInputFiles")
            .unwrap();
        assert_eq!(lcio.text(), Some("a.slcio b.slcio"));
        let records = global
            .child_where("parameter", "name", "MaxRecordNumber")
            .unwrap();
        assert_eq!(records.text(), Some("500"));
        assert_eq!(records.attribute("value"), None);

        let pfo = snapshot
            .child_where("processor", "name", "MyPfoAnalysis")
            .unwrap();
        assert_eq!(
            pfo.child_where("parameter", "name", "RootFile").unwrap().text(),
            Some("out.root")
        );
        // The template itself is untouched.
        assert_eq!(
            marlin
                .processor_parameter("MyEcalBarrelDigi", "calibration_mip")
                .unwrap(),
            "0.0001"
        );
    }

    #[test]
    fn run_list_restricts_the_execute_section() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        marlin.run_only(&["InitDD4hep".to_string(), "MyPfoAnalysis".to_string()]);

        let snapshot = marlin.render().unwrap();
        let execute = snapshot.child("execute").unwrap();
        let names: Vec<_> = execute
            .children_named("processor")
            .filter_map(|p| p.attribute("name"))
            .collect();
        assert_eq!(names, vec!["InitDD4hep", "MyPfoAnalysis"]);
        // Nested <if> groups are filtered as well.
        let nested = execute.child("if").unwrap();
        assert_eq!(nested.children_named("processor").count(), 0);
    }

    #[test]
    fn includes_are_spliced() {
        let directory = tempfile::tempdir().unwrap();
        let included = directory.path().join("digitizers.xml");
        std::fs::write(
            &included,
            r#"<marlin>
  <processor name="MyHcalBarrelDigi">
    <parameter name="calibration_mip" value="0.0004"/>
  </processor>
</marlin>"#,
        )
        .unwrap();
        let steering = directory.path().join("steering.xml");
        std::fs::write(
            &steering,
            r#"<marlin>
  <execute><processor name="MyHcalBarrelDigi"/></execute>
  <global><parameter name="LCIOInputFiles"> </parameter>
    <parameter name="MaxRecordNumber" value="0"/>
    <parameter name="SkipNEvents" value="0"/>
    <parameter name="Verbosity" value="MESSAGE"/>
    <parameter name="RandomSeed" value="1"/>
  </global>
  <include ref="digitizers.xml"/>
</marlin>"#,
        )
        .unwrap();

        let marlin = Marlin::from_steering_file(&steering).unwrap();
        assert_eq!(
            marlin
                .processor_parameter("MyHcalBarrelDigi", "calibration_mip")
                .unwrap(),
            "0.0004"
        );
    }

    #[test]
    fn missing_step_record_is_not_an_error() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        let document = CalibrationDocument::new();
        marlin.load_step_output(&document, "MipScale").unwrap();
    }

    #[test]
    fn step_outputs_are_imported() {
        let file = steering_file(STEERING);
        let mut marlin = Marlin::from_steering_file(file.path()).unwrap();
        let mut document = CalibrationDocument::new();
        document
            .step_entry("MipScale")
            .output_mut()
            .set_processor("MyEcalBarrelDigi", "calibration_mip", "0.0003");
        marlin.load_step_output(&document, "MipScale").unwrap();
        assert_eq!(
            marlin
                .processor_parameter("MyEcalBarrelDigi", "calibration_mip")
                .unwrap(),
            "0.0003"
        );
    }
}
