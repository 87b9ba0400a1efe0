use xmltree::{Element, XMLNode};

use crate::error::{JenkinsError, Result};

/// Rewrites a pipeline job's persisted `config.xml` so its next run
/// executes `script`.
///
/// The job must be a pipeline job (`<flow-definition>` root) whose
/// script body can be overwritten. The job's quiet period is forced to
/// zero so the triggered run starts immediately instead of waiting out
/// a debounce window.
pub fn inject_pipeline_script(config_xml: &str, script: &str) -> Result<String> {
    let mut root =
        Element::parse(config_xml.as_bytes()).map_err(|e| JenkinsError::Xml(e.to_string()))?;

    if root.name != "flow-definition" {
        return Err(JenkinsError::Xml(format!(
            "expected a pipeline job config (<flow-definition>), found <{}>",
            root.name
        )));
    }

    let definition = root
        .get_mut_child("definition")
        .ok_or_else(|| JenkinsError::Xml("job config has no <definition> element".to_string()))?;
    set_text(child_or_insert(definition, "script"), script);

    set_text(child_or_insert(&mut root, "quietPeriod"), "0");

    let mut out = Vec::new();
    root.write(&mut out)
        .map_err(|e| JenkinsError::Xml(e.to_string()))?;

    String::from_utf8(out).map_err(|e| JenkinsError::Xml(e.to_string()))
}

fn child_or_insert<'a>(parent: &'a mut Element, name: &str) -> &'a mut Element {
    if parent.get_mut_child(name).is_none() {
        parent
            .children
            .push(XMLNode::Element(Element::new(name)));
    }

    parent.get_mut_child(name).expect("element inserted above")
}

fn set_text(element: &mut Element, text: &str) {
    element
        .children
        .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
    element.children.push(XMLNode::Text(text.to_string()));
}
