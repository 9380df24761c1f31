//! End-to-end compile scenarios over YAML fixtures.

use fwforge_compiler::{CompileStatus, Driver, OutputFormat};
use fwforge_model::yaml;

fn compile(doc: &str, format: OutputFormat) -> fwforge_compiler::DriverOutput {
    let store = yaml::load_str(doc).unwrap();
    let fw = store.find_by_name("fw").unwrap();
    Driver::new(&store, fw, format).run().unwrap()
}

fn compile_err(doc: &str, format: OutputFormat) -> fwforge_compiler::CompileError {
    let store = yaml::load_str(doc).unwrap();
    let fw = store.find_by_name("fw").unwrap();
    Driver::new(&store, fw, format).run().unwrap_err()
}

const BASE_FW: &str = r#"
services:
  - { name: ssh, type: tcp, dst: "22" }
  - { name: http, type: tcp, dst: "80" }
  - { name: https, type: tcp, dst: "443" }
firewalls:
  - name: fw
    platform: iptables
    OPTIONS
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 10.0.0.1/24 } ]
    policy:
      - name: Policy
        rules:
RULES
"#;

fn doc(options: &str, rules: &str) -> String {
    BASE_FW.replace("OPTIONS", options).replace("RULES", rules)
}

#[test]
fn scenario_trivial_accept() {
    let doc = doc(
        "options: {}",
        "          - { src: [any], dst: [fw], srv: [ssh], action: accept }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    assert_eq!(out.status, CompileStatus::Ok);

    let rule_lines: Vec<&str> = out
        .text
        .lines()
        .filter(|l| l.contains("-A INPUT"))
        .collect();
    assert_eq!(
        rule_lines,
        vec![
            "$IPTABLES -w -t filter -A INPUT -p tcp -m tcp --dport 22 -m conntrack --ctstate NEW -j ACCEPT"
        ]
    );
}

#[test]
fn scenario_any_includes_firewall_split() {
    let doc = doc(
        "options: { firewall_is_part_of_any_and_networks: \"true\" }",
        "          - { src: [any], dst: [any], srv: [http], action: accept }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    let has = |chain: &str| {
        out.text
            .lines()
            .any(|l| l.contains(&format!("-A {} ", chain)) && l.contains("--dport 80"))
    };
    assert!(has("FORWARD"), "missing FORWARD rule:\n{}", out.text);
    assert!(has("INPUT"), "missing INPUT rule:\n{}", out.text);
    assert!(has("OUTPUT"), "missing OUTPUT rule:\n{}", out.text);
}

#[test]
fn scenario_negation_temp_chain() {
    let doc = r#"
addresses:
  - { name: net-a, type: network, network: 10.0.0.0/8 }
  - { name: net-b, type: network, network: 172.16.0.0/12 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 192.168.1.1/24 } ]
    policy:
      - name: Policy
        rules:
          - { src: [net-a, net-b], src_neg: true, action: accept }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);

    // One fresh chain is declared and jumped to.
    let decl: Vec<&str> = out
        .text
        .lines()
        .filter(|l| l.starts_with("$IPTABLES -N "))
        .collect();
    assert_eq!(decl.len(), 1, "{}", out.text);
    let chain = decl[0].trim_start_matches("$IPTABLES -N ");
    assert!(
        out.text.contains(&format!("-j {}", chain)),
        "{}",
        out.text
    );

    // Two RETURNs (one per negated network) and the action inside it.
    let in_chain: Vec<&str> = out
        .text
        .lines()
        .filter(|l| l.contains(&format!("-A {} ", chain)))
        .collect();
    let returns = in_chain.iter().filter(|l| l.ends_with("-j RETURN")).count();
    assert_eq!(returns, 2, "{:#?}", in_chain);
    assert_eq!(
        in_chain.iter().filter(|l| l.contains("-j ACCEPT")).count(),
        1,
        "{:#?}",
        in_chain
    );
}

#[test]
fn scenario_snat_masquerade() {
    let doc = r#"
addresses:
  - { name: lan, type: network, network: 10.0.0.0/24 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        dynamic: true
        addresses: [ { name: eth0-ip, network: 192.0.2.1/24 } ]
    nat:
      - name: NAT
        rules:
          - { osrc: [lan], tsrc: [eth0-ip] }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);
    assert!(
        out.text.contains(
            "$IPTABLES -w -t nat -A POSTROUTING -o eth0 -s 10.0.0.0/24 -j MASQUERADE"
        ),
        "{}",
        out.text
    );
}

#[test]
fn scenario_firewall_in_both_src_and_dst() {
    // The firewall talking to itself never crosses FORWARD; the rule must
    // land in both OUTPUT and INPUT.
    let doc = doc(
        "options: {}",
        "          - { src: [fw], dst: [fw], srv: [ssh], action: accept }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    let input: Vec<&str> = out.text.lines().filter(|l| l.contains("-A INPUT")).collect();
    let output: Vec<&str> = out.text.lines().filter(|l| l.contains("-A OUTPUT")).collect();
    assert_eq!(input.len(), 1, "{}", out.text);
    assert_eq!(output.len(), 1, "{}", out.text);
    // Each side keeps the match the chain itself cannot imply.
    assert!(input[0].contains("-s 10.0.0.1") && input[0].contains("--dport 22"), "{}", input[0]);
    assert!(output[0].contains("-d 10.0.0.1") && output[0].contains("--dport 22"), "{}", output[0]);
    assert!(!input[0].contains("-d "), "{}", input[0]);
    assert!(!output[0].contains("-s "), "{}", output[0]);
    assert!(!out.text.contains("-A FORWARD"), "{}", out.text);
}

#[test]
fn scenario_multiport_grouping() {
    let doc = doc(
        "options: {}",
        "          - { src: [any], dst: [fw], srv: [ssh, http, https], action: accept }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    assert!(
        out.text.contains("-m multiport --dports 22,80,443"),
        "{}",
        out.text
    );
}

#[test]
fn scenario_shadowing_abort() {
    let doc = doc(
        "options: { check_shading: \"true\" }",
        r#"          - { src: [any], dst: [any], srv: [any], action: accept, label: "rule A" }
          - { src: [any], dst: [any], srv: [ssh], action: deny, label: "rule B" }"#,
    );
    let err = compile_err(&doc, OutputFormat::IptablesScript);
    let msg = err.to_string();
    assert!(
        msg.contains("rule B") && msg.contains("rule A"),
        "abort must reference both rules: {}",
        msg
    );
}

#[test]
fn determinism_across_runs() {
    let doc = doc(
        "options: { firewall_is_part_of_any_and_networks: \"true\" }",
        r#"          - { src: [any], dst: [fw], srv: [ssh, http], action: accept, options: { log: true } }
          - { src: [any], dst: [any], srv: [https], action: deny }"#,
    );
    let a = compile(&doc, OutputFormat::IptablesScript);
    let b = compile(&doc, OutputFormat::IptablesScript);
    assert_eq!(
        fwforge_compiler::normalize::normalize(&a.text),
        fwforge_compiler::normalize::normalize(&b.text)
    );
}

#[test]
fn firewall_stripping_soundness() {
    // After chain selection, INPUT rules must not mention the firewall's
    // own address in -d, nor OUTPUT rules in -s.
    let doc = doc(
        "options: { firewall_is_part_of_any_and_networks: \"true\" }",
        "          - { src: [any], dst: [any], srv: [http], action: accept }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    for line in out.text.lines() {
        if line.contains("-A INPUT") {
            assert!(!line.contains("-d 10.0.0.1"), "{}", line);
        }
        if line.contains("-A OUTPUT") {
            assert!(!line.contains("-s 10.0.0.1"), "{}", line);
        }
    }
}

#[test]
fn chain_usage_closure() {
    // Every -N chain must be referenced by some -j.
    let doc = r#"
addresses:
  - { name: net-a, type: network, network: 10.1.0.0/16 }
  - { name: net-b, type: network, network: 10.2.0.0/16 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 192.168.1.1/24 } ]
    policy:
      - name: Policy
        rules:
          - { src: [net-a, net-b], src_neg: true, action: accept, options: { log: true } }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);
    for line in out.text.lines() {
        if let Some(chain) = line.strip_prefix("$IPTABLES -N ") {
            assert!(
                out.text.contains(&format!("-j {}", chain)),
                "chain {} declared but never referenced:\n{}",
                chain,
                out.text
            );
        }
    }
}

#[test]
fn address_family_purity() {
    let doc = r#"
addresses:
  - { name: v6net, type: network, network: "2001:db8::/32" }
  - { name: v4net, type: network, network: 10.0.0.0/24 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 192.168.1.1/24 } ]
    policy:
      - name: Policy
        family: ipv4
        rules:
          - { src: [v6net, v4net], action: deny }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);
    assert!(!out.text.contains("2001:db8"), "{}", out.text);
    assert!(out.text.contains("10.0.0.0/24"), "{}", out.text);
}

#[test]
fn atomic_form_at_emit() {
    // Multiple sources and destinations end up one per rule line.
    let doc = r#"
addresses:
  - { name: a, type: address, address: 10.1.0.1 }
  - { name: b, type: address, address: 10.1.0.2 }
  - { name: c, type: address, address: 10.2.0.1 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 192.168.1.1/24 } ]
    policy:
      - name: Policy
        rules:
          - { src: [a, b], dst: [c], action: deny }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);
    // Every emitted command matches at most one source and one destination.
    for line in out.text.lines().filter(|l| l.contains("-A ")) {
        assert!(line.matches(" -s ").count() <= 1, "{}", line);
        assert!(line.matches(" -d ").count() <= 1, "{}", line);
    }
    // Both sources appear somewhere, as does the destination.
    assert!(out.text.contains("-s 10.1.0.1"), "{}", out.text);
    assert!(out.text.contains("-s 10.1.0.2"), "{}", out.text);
    assert!(out.text.contains("-d 10.2.0.1"), "{}", out.text);
}

#[test]
fn reject_rule_carries_reject_with() {
    let doc = doc(
        "options: {}",
        "          - { src: [any], dst: [fw], srv: [ssh], action: reject, options: { reject_with: tcp-reset } }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    assert!(
        out.text.contains("-j REJECT --reject-with tcp-reset"),
        "{}",
        out.text
    );
}

#[test]
fn logging_builds_temp_chain_with_log_and_verdict() {
    let doc = doc(
        "options: {}",
        "          - { src: [any], dst: [fw], srv: [ssh], action: accept, options: { log: true } }",
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    assert!(out.text.contains("-j LOG --log-level"), "{}", out.text);
    assert!(out.text.contains("-j ACCEPT"), "{}", out.text);
    // Jump into the log chain from INPUT.
    let decl: Vec<&str> = out
        .text
        .lines()
        .filter(|l| l.starts_with("$IPTABLES -N "))
        .collect();
    assert_eq!(decl.len(), 1, "{}", out.text);
}

#[test]
fn disabled_rules_are_not_compiled() {
    let doc = doc(
        "options: {}",
        r#"          - { src: [any], dst: [fw], srv: [ssh], action: accept, disabled: true }
          - { src: [any], dst: [fw], srv: [http], action: accept }"#,
    );
    let out = compile(&doc, OutputFormat::IptablesScript);
    assert!(!out.text.contains("--dport 22"), "{}", out.text);
    assert!(out.text.contains("--dport 80"), "{}", out.text);
}

#[test]
fn nftables_backend_end_to_end() {
    let doc = doc(
        "options: {}",
        "          - { src: [any], dst: [fw], srv: [ssh], action: accept }",
    );
    let out = compile(&doc, OutputFormat::Nftables);
    assert!(out.text.contains("flush ruleset"), "{}", out.text);
    assert!(
        out.text.contains("type filter hook input priority filter; policy drop;"),
        "{}",
        out.text
    );
    assert!(
        out.text.contains("tcp dport 22 ct state new accept"),
        "{}",
        out.text
    );
}

#[test]
fn errors_set_exit_status_but_keep_output() {
    // 0.0.0.0 source is a per-rule error; compile finishes with Errors.
    let doc = r#"
addresses:
  - { name: zero, type: address, address: 0.0.0.0 }
firewalls:
  - name: fw
    platform: iptables
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 192.168.1.1/24 } ]
    policy:
      - name: Policy
        rules:
          - { src: [zero], action: deny }
"#;
    let out = compile(doc, OutputFormat::IptablesScript);
    assert_eq!(out.status, CompileStatus::Errors);
    assert!(out.errors >= 1);
    assert!(out.text.contains("# error:"), "{}", out.text);
}
