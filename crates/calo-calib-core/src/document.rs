//! The calibration document: one XML ledger per calibration campaign.
//!
//! The document is both the configuration input and the running record of
//! the pipeline. It holds exactly one `input` section (user-supplied
//! starting parameters) and an ordered set of `step` records, each with an
//! `output` section (committed constants) and an `iterations` section
//! (per-iteration diagnostics). A step name is unique: re-running a step
//! removes its previous record in full before a fresh one is appended.

use std::fmt::Display;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::xml::Element;

/// One entry of a parameter section: either a plain named value
/// (`<name>value</name>`) or a processor-bound parameter
/// (`<parameter processor="P" name="N">value</parameter>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub processor: Option<String>,
    pub name: String,
    pub value: String,
}

/// Ordered name → value store with upsert semantics on both entry forms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: Vec<Entry>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Plain named value, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.processor.is_none() && entry.name == name)
            .map(|entry| entry.value.as_str())
    }

    /// Insert or replace a plain named value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Display) {
        let name = name.into();
        let value = value.to_string();
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.processor.is_none() && entry.name == name)
        {
            Some(entry) => entry.value = value,
            None => self.entries.push(Entry {
                processor: None,
                name,
                value,
            }),
        }
    }

    /// Insert or replace a processor-bound parameter.
    pub fn set_processor(
        &mut self,
        processor: impl Into<String>,
        name: impl Into<String>,
        value: impl Display,
    ) {
        let processor = processor.into();
        let name = name.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|entry| {
            entry.processor.as_deref() == Some(processor.as_str()) && entry.name == name
        }) {
            Some(entry) => entry.value = value,
            None => self.entries.push(Entry {
                processor: Some(processor),
                name,
                value,
            }),
        }
    }

    /// Iterate over processor-bound parameters as `(processor, name, value)`.
    pub fn processor_entries(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.entries.iter().filter_map(|entry| {
            entry
                .processor
                .as_deref()
                .map(|processor| (processor, entry.name.as_str(), entry.value.as_str()))
        })
    }

    fn from_element(parent: &Element) -> Self {
        let mut set = Self::new();
        for child in parent.children() {
            if child.name() == "parameter" {
                if let (Some(processor), Some(name)) =
                    (child.attribute("processor"), child.attribute("name"))
                {
                    set.set_processor(processor, name, child.text().unwrap_or_default());
                    continue;
                }
            }
            set.set(child.name(), child.text().unwrap_or_default());
        }
        set
    }

    fn to_element(&self, tag: &str) -> Element {
        let mut element = Element::new(tag);
        for entry in &self.entries {
            match &entry.processor {
                Some(processor) => {
                    let mut parameter = Element::with_text("parameter", entry.value.clone());
                    parameter.set_attribute("processor", processor.clone());
                    parameter.set_attribute("name", entry.name.clone());
                    element.push_child(parameter);
                }
                None => element.push_child(Element::with_text(
                    entry.name.clone(),
                    entry.value.clone(),
                )),
            }
        }
        element
    }
}

/// Diagnostics of one convergence-loop iteration. Immutable once written;
/// never read back by later steps.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    id: usize,
    fields: Vec<(String, String)>,
}

impl IterationRecord {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            fields: Vec::new(),
        }
    }

    /// Append a named numeric field.
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.parse().ok())
    }

    fn from_element(element: &Element) -> Result<Self> {
        let id = element
            .attribute("id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| Error::Xml {
                detail: "iteration element without a numeric 'id' attribute".into(),
            })?;
        let fields = element
            .children()
            .iter()
            .map(|child| {
                (
                    child.name().to_string(),
                    child.text().unwrap_or_default().to_string(),
                )
            })
            .collect();
        Ok(Self { id, fields })
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new("iteration");
        element.set_attribute("id", self.id.to_string());
        for (name, value) in &self.fields {
            element.push_child(Element::with_text(name.clone(), value.clone()));
        }
        element
    }
}

/// The record of one pipeline step inside the document.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    name: String,
    iterations: Vec<IterationRecord>,
    output: ParameterSet,
}

impl StepRecord {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: Vec::new(),
            output: ParameterSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }

    pub fn push_iteration(&mut self, record: IterationRecord) {
        self.iterations.push(record);
    }

    pub fn output(&self) -> &ParameterSet {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut ParameterSet {
        &mut self.output
    }

    fn from_element(element: &Element) -> Result<Self> {
        let name = element.attribute("name").ok_or_else(|| Error::Xml {
            detail: "step element without a 'name' attribute".into(),
        })?;
        let mut step = Self::new(name);
        if let Some(iterations) = element.child("iterations") {
            for iteration in iterations.children_named("iteration") {
                step.iterations.push(IterationRecord::from_element(iteration)?);
            }
        }
        if let Some(output) = element.child("output") {
            step.output = ParameterSet::from_element(output);
        }
        Ok(step)
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new("step");
        element.set_attribute("name", self.name.clone());
        if !self.iterations.is_empty() {
            let mut iterations = Element::new("iterations");
            for record in &self.iterations {
                iterations.push_child(record.to_element());
            }
            element.push_child(iterations);
        }
        if !self.output.is_empty() {
            element.push_child(self.output.to_element("output"));
        }
        element
    }
}

/// The XML-backed calibration ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationDocument {
    input: ParameterSet,
    steps: Vec<StepRecord>,
}

impl CalibrationDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document; the root element must be `calibration`.
    pub fn from_xml(input: &str) -> Result<Self> {
        let root = Element::from_str(input)?;
        Self::from_element(&root)
    }

    /// Load a document from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let root = Element::load(path)?;
        Self::from_element(&root)
    }

    fn from_element(root: &Element) -> Result<Self> {
        if root.name() != "calibration" {
            return Err(Error::Xml {
                detail: format!("expected root 'calibration', found '{}'", root.name()),
            });
        }
        let mut document = Self::new();
        if let Some(input) = root.child("input") {
            document.input = ParameterSet::from_element(input);
        }
        for step in root.children_named("step") {
            document.steps.push(StepRecord::from_element(step)?);
        }
        Ok(document)
    }

    /// Serialize the whole document.
    pub fn to_xml(&self) -> Result<String> {
        let mut root = Element::new("calibration");
        root.push_child(self.input.to_element("input"));
        for step in &self.steps {
            root.push_child(step.to_element());
        }
        root.to_xml_string()
    }

    /// Persist the document to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        log::debug!("writing calibration document to {}", path.display());
        let xml = self.to_xml()?;
        fs::write(path, xml).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn input(&self) -> &ParameterSet {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut ParameterSet {
        &mut self.input
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Drop a step record entirely. Returns whether one existed.
    pub fn remove_step(&mut self, name: &str) -> bool {
        let before = self.steps.len();
        self.steps.retain(|step| step.name != name);
        self.steps.len() != before
    }

    /// The step record for `name`, appended fresh if absent.
    pub fn step_entry(&mut self, name: &str) -> &mut StepRecord {
        if let Some(index) = self.steps.iter().position(|step| step.name == name) {
            return &mut self.steps[index];
        }
        self.steps.push(StepRecord::new(name));
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    /// Look a named value up in a dependency step's output first, then in
    /// the user input section.
    ///
    /// # Errors
    ///
    /// `MissingParameter` when the value is found in neither place.
    pub fn value_from(&self, name: &str, step: Option<&str>) -> Result<&str> {
        if let Some(step_name) = step {
            if let Some(value) = self.step(step_name).and_then(|step| step.output.get(name)) {
                return Ok(value);
            }
        }
        self.input.get(name).ok_or_else(|| Error::MissingParameter {
            name: name.to_string(),
            step: step.map(str::to_string),
        })
    }

    /// `value_from`, parsed as a float.
    pub fn f64_from(&self, name: &str, step: Option<&str>) -> Result<f64> {
        let value = self.value_from(name, step)?;
        parse_f64(name, value)
    }

    /// `value_from`, parsed as a space-separated float vector.
    pub fn f64_list_from(&self, name: &str, step: Option<&str>) -> Result<Vec<f64>> {
        let value = self.value_from(name, step)?;
        value
            .split_whitespace()
            .map(|token| parse_f64(name, token))
            .collect()
    }

    /// Float from the input section, falling back to a default when the
    /// name is absent. A present-but-malformed value is still an error.
    pub fn input_f64_or(&self, name: &str, default: f64) -> Result<f64> {
        match self.input.get(name) {
            Some(value) => parse_f64(name, value),
            None => Ok(default),
        }
    }

    /// Two-component float vector from the input section with a default.
    pub fn input_f64_pair_or(&self, name: &str, default: (f64, f64)) -> Result<(f64, f64)> {
        match self.input.get(name) {
            Some(value) => {
                let parts: Vec<f64> = value
                    .split_whitespace()
                    .map(|token| parse_f64(name, token))
                    .collect::<Result<_>>()?;
                if parts.len() != 2 {
                    return Err(Error::InvalidParameter {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                Ok((parts[0], parts[1]))
            }
            None => Ok(default),
        }
    }
}

fn parse_f64(name: &str, value: &str) -> Result<f64> {
    value.parse().map_err(|_| Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> CalibrationDocument {
        CalibrationDocument::from_xml(
            r#"<calibration>
                 <input>
                   <ecalFactors>42.91 93.81</ecalFactors>
                   <photonEnergy>10</photonEnergy>
                   <parameter processor="MyEcalBarrelDigi" name="calibration_mip">0.0001575</parameter>
                 </input>
                 <step name="MipScale">
                   <output>
                     <hcalBarrelMip>0.0004925</hcalBarrelMip>
                   </output>
                 </step>
               </calibration>"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_input_and_steps() {
        let document = sample_document();
        assert_eq!(document.input().get("photonEnergy"), Some("10"));
        assert_eq!(
            document.f64_list_from("ecalFactors", None).unwrap(),
            vec![42.91, 93.81]
        );
        let processor_entries: Vec<_> = document.input().processor_entries().collect();
        assert_eq!(
            processor_entries,
            vec![("MyEcalBarrelDigi", "calibration_mip", "0.0001575")]
        );
        assert!(document.step("MipScale").is_some());
    }

    #[test]
    fn value_from_prefers_dependency_output() {
        let document = sample_document();
        assert_eq!(
            document
                .f64_from("hcalBarrelMip", Some("MipScale"))
                .unwrap(),
            0.0004925
        );
    }

    #[test]
    fn value_from_falls_back_to_input() {
        let document = sample_document();
        // Not in the MipScale output, but present in the input section.
        assert_eq!(
            document.f64_from("photonEnergy", Some("MipScale")).unwrap(),
            10.0
        );
    }

    #[test]
    fn missing_value_names_both_locations() {
        let document = sample_document();
        let error = document
            .value_from("hcalRingMip", Some("MipScale"))
            .unwrap_err();
        match error {
            Error::MissingParameter { name, step } => {
                assert_eq!(name, "hcalRingMip");
                assert_eq!(step.as_deref(), Some("MipScale"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_number_is_reported() {
        let document = CalibrationDocument::from_xml(
            "<calibration><input><photonEnergy>ten</photonEnergy></input></calibration>",
        )
        .unwrap();
        assert!(matches!(
            document.input_f64_or("photonEnergy", 10.0),
            Err(Error::InvalidParameter { .. })
        ));
        assert_eq!(document.input_f64_or("kaon0LEnergy", 20.0).unwrap(), 20.0);
    }

    #[test]
    fn rerun_replaces_the_step_record() {
        let mut document = sample_document();
        document
            .step_entry("EcalEnergy")
            .push_iteration(IterationRecord::new(0).with_field("precision", 0.5));
        document
            .step_entry("EcalEnergy")
            .output_mut()
            .set("ecalFactors", "1 2");

        // Second run: the step removes its stale record first.
        assert!(document.remove_step("EcalEnergy"));
        document
            .step_entry("EcalEnergy")
            .output_mut()
            .set("ecalFactors", "3 4");

        let matching: Vec<_> = document
            .steps()
            .iter()
            .filter(|step| step.name() == "EcalEnergy")
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].iterations().is_empty());
        assert_eq!(matching[0].output().get("ecalFactors"), Some("3 4"));
    }

    #[test]
    fn write_output_is_idempotent() {
        let mut document = CalibrationDocument::new();
        for _ in 0..2 {
            let output = document.step_entry("EcalEnergy").output_mut();
            output.set("ecalFactors", "42.91 93.81");
            output.set_processor("MyEcalBarrelReco", "calibration_factorsMipGev", "42.91 93.81");
        }
        let first = document.to_xml().unwrap();
        {
            let output = document.step_entry("EcalEnergy").output_mut();
            output.set("ecalFactors", "42.91 93.81");
            output.set_processor("MyEcalBarrelReco", "calibration_factorsMipGev", "42.91 93.81");
        }
        let second = document.to_xml().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn xml_round_trip() {
        let mut document = sample_document();
        document
            .step_entry("EcalEnergy")
            .push_iteration(
                IterationRecord::new(0)
                    .with_field("precision", 0.5)
                    .with_field("rescale", 2.0),
            );
        let xml = document.to_xml().unwrap();
        let reparsed = CalibrationDocument::from_xml(&xml).unwrap();
        assert_eq!(reparsed, document);

        let record = &reparsed.step("EcalEnergy").unwrap().iterations()[0];
        assert_eq!(record.id(), 0);
        assert_eq!(record.field("rescale"), Some(2.0));
    }

    #[test]
    fn rejects_foreign_root() {
        assert!(matches!(
            CalibrationDocument::from_xml("<marlin/>"),
            Err(Error::Xml { .. })
        ));
    }
}
