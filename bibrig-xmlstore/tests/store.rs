//! Directory-layout behaviour of the XML store.

use std::fs;
use std::time::Duration;

use tempfile::TempDir;

use bibrig::config::{ConfigStore, DescriptionMatch, Handshake, Phase};
use bibrig_xmlstore::XmlConfigStore;

const DEMO_BIB: &str = r#"<?xml version="1.0"?>
<bib id="demo">
  <uut id="u1">
    <mapping description_contains="demo.u1" manufacturer="FTDI"/>
    <port number="1">
      <protocol>rs232</protocol>
      <speed>9600</speed>
      <data_pattern>n81</data_pattern>
      <read_timeout>2000</read_timeout>
      <write_timeout>1500</write_timeout>
      <handshake>hardware</handshake>
      <start>
        <command>INIT</command>
        <expected_response>READY</expected_response>
      </start>
      <test continue_on_failure="true" timeout_ms="3000" retries="2">
        <command>PING</command>
        <expected_response regex="true">^PONG$</expected_response>
        <validation_levels>
          <warn>DEGRADED</warn>
          <fail>ERR</fail>
          <critical trigger_hardware="true">FATAL</critical>
        </validation_levels>
      </test>
      <stop>
        <command>QUIT</command>
        <expected_response>BYE</expected_response>
      </stop>
    </port>
  </uut>
</bib>
"#;

fn store_with(files: &[(&str, &str)]) -> (TempDir, XmlConfigStore) {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    let store = XmlConfigStore::new(dir.path());
    (dir, store)
}

#[test]
fn loads_bib_per_file() {
    let (_dir, store) = store_with(&[("bib_demo.xml", DEMO_BIB)]);

    let bib = store.load_bib("demo").unwrap().expect("bib found");
    assert_eq!(bib.id, "demo");
    let port = bib.port("u1", 1).expect("port 1");
    assert_eq!(port.protocol, "rs232");
    assert_eq!(port.speed, 9600);
    assert_eq!(port.handshake, Handshake::Hardware);
    assert_eq!(port.write_timeout, Duration::from_millis(1500));

    let start = &port.sequence(Phase::Start).commands;
    assert_eq!(start.len(), 1);
    assert_eq!(start[0].command, "INIT");
    assert_eq!(start[0].expected.as_ref().unwrap().text, "READY");
    assert!(!start[0].expected.as_ref().unwrap().regex);

    let test = &port.sequence(Phase::Test).commands[0];
    assert!(test.continue_on_failure);
    assert_eq!(test.timeout, Duration::from_millis(3000));
    assert_eq!(test.retries, 2);
    assert!(test.expected.as_ref().unwrap().regex);
    let levels = test.levels.as_ref().unwrap();
    assert_eq!(levels.warn.as_ref().unwrap().text, "DEGRADED");
    assert_eq!(levels.critical.as_ref().unwrap().text, "FATAL");
    assert!(levels.trigger_hardware);

    assert!(port.sequence(Phase::Test).continue_on_failure());
    assert!(!port.sequence(Phase::Start).continue_on_failure());
}

#[test]
fn bib_id_match_is_case_insensitive() {
    let (_dir, store) = store_with(&[("bib_demo.xml", DEMO_BIB)]);
    assert!(store.load_bib("DEMO").unwrap().is_some());
    assert!(store.load_bib("other").unwrap().is_none());
}

#[test]
fn legacy_file_is_a_fallback_only() {
    let legacy = r#"<root>
  <bib id="legacy_only">
    <uut id="u1"><port number="1"><protocol>rs232</protocol></port></uut>
  </bib>
  <bib id="demo">
    <uut id="from_legacy"><port number="1"><protocol>rs232</protocol></port></uut>
  </bib>
</root>
"#;
    let (_dir, store) = store_with(&[
        ("bib_demo.xml", DEMO_BIB),
        ("bib_configurations.xml", legacy),
    ]);

    // demo exists as an individual file: the legacy copy must lose.
    let demo = store.load_bib("demo").unwrap().unwrap();
    assert!(demo.uut("u1").is_some());
    assert!(demo.uut("from_legacy").is_none());

    // legacy_only exists only in the legacy document.
    assert!(store.load_bib("legacy_only").unwrap().is_some());

    let mut ids = store.list_configured_bibs().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["demo", "legacy_only"]);
}

#[test]
fn unknown_elements_and_attributes_are_ignored() {
    let xml = r#"<bib id="demo" revision="7">
  <notes>for line 3</notes>
  <uut id="u1" station="west">
    <port number="1" color="green">
      <protocol>rs232</protocol>
      <gpio_map>ignored</gpio_map>
      <start future_flag="yes">
        <command>INIT</command>
        <expected_response>READY</expected_response>
        <annotation>also ignored</annotation>
      </start>
    </port>
  </uut>
</bib>
"#;
    let (_dir, store) = store_with(&[("bib_demo.xml", xml)]);
    let bib = store.load_bib("demo").unwrap().unwrap();
    let port = bib.port("u1", 1).unwrap();
    assert_eq!(port.sequence(Phase::Start).commands.len(), 1);
    assert!(port.sequence(Phase::Test).is_empty());
}

#[test]
fn mapping_rules_are_collected_across_bibs() {
    let other = r#"<bib id="line2">
  <uut id="u1">
    <mapping description_equals="Line2 Bridge" serial="FT0AAA"/>
    <port number="1"><protocol>rs232</protocol></port>
  </uut>
</bib>
"#;
    let (_dir, store) = store_with(&[("bib_demo.xml", DEMO_BIB), ("bib_line2.xml", other)]);

    let rules = store.mapping_rules().unwrap();
    assert_eq!(rules.len(), 2);

    let demo = rules.iter().find(|r| r.bib_id == "demo").unwrap();
    assert_eq!(
        demo.description,
        DescriptionMatch::Contains("demo.u1".into())
    );
    assert_eq!(demo.manufacturer.as_deref(), Some("FTDI"));

    let line2 = rules.iter().find(|r| r.bib_id == "line2").unwrap();
    assert_eq!(
        line2.description,
        DescriptionMatch::Equals("Line2 Bridge".into())
    );
    assert_eq!(line2.serial.as_deref(), Some("FT0AAA"));
}

#[test]
fn malformed_file_is_skipped_not_fatal() {
    let (_dir, store) = store_with(&[
        ("bib_demo.xml", DEMO_BIB),
        ("bib_broken.xml", "<bib id='broken'><uut"),
    ]);
    // The broken file is skipped; the good one still loads.
    assert_eq!(store.list_configured_bibs().unwrap(), vec!["demo"]);
    assert!(store.load_bib("demo").unwrap().is_some());
    assert!(store.load_bib("broken").unwrap().is_none());
}

#[test]
fn missing_directory_means_no_bibs() {
    let store = XmlConfigStore::new("/nonexistent/for/sure");
    assert!(store.list_configured_bibs().unwrap().is_empty());
    assert!(store.load_bib("demo").unwrap().is_none());
}

#[test]
fn multiple_phase_children_build_ordered_sequences() {
    let xml = r#"<bib id="demo">
  <uut id="u1">
    <port number="1">
      <protocol>rs232</protocol>
      <test><command>T1</command><expected_response>OK</expected_response></test>
      <test><command>T2</command><expected_response>OK</expected_response></test>
      <test continue_on_failure="true"><command>T3</command></test>
    </port>
  </uut>
</bib>
"#;
    let (_dir, store) = store_with(&[("bib_demo.xml", xml)]);
    let bib = store.load_bib("demo").unwrap().unwrap();
    let test = bib.port("u1", 1).unwrap().sequence(Phase::Test).clone();
    let commands: Vec<&str> = test.commands.iter().map(|c| c.command.as_str()).collect();
    assert_eq!(commands, vec!["T1", "T2", "T3"]);
    // One opted-in command makes the whole sequence continue-on-failure.
    assert!(test.continue_on_failure());
}
