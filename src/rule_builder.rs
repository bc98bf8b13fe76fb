/// SecRule assembly
///
/// Each attack family has a fixed template (inspected variables, ordered
/// transformation chain, severity, tags). The builder combines a template with a
/// synthesized regex into one single-line rule:
///
///   SecRule <vars> "@rx <regex>" "t:...,id:<id>,phase:2,deny,log,msg:'...',severity:...,tag:'...'"
use crate::models::{AttackLabel, AttackType, GeneratedRule, Signature};

#[derive(Debug, Clone, Copy)]
pub struct RuleTemplate {
    pub variables: &'static str,
    pub transformations: &'static [&'static str],
    pub severity: &'static str,
    pub tags: &'static [&'static str],
}

pub fn template_for(attack_type: AttackType) -> RuleTemplate {
    match attack_type {
        AttackType::PathTraversal => RuleTemplate {
            variables: "REQUEST_URI|ARGS",
            transformations: &["t:urlDecodeUni", "t:normalizePath", "t:lowercase", "t:removeNulls"],
            severity: "CRITICAL",
            tags: &["attack-lfi", "attack-path-traversal"],
        },
        AttackType::CodeInjection => RuleTemplate {
            variables: "REQUEST_URI|ARGS|REQUEST_BODY",
            transformations: &[
                "t:urlDecodeUni",
                "t:lowercase",
                "t:removeNulls",
                "t:compressWhitespace",
            ],
            severity: "CRITICAL",
            tags: &["attack-code-injection", "attack-rce"],
        },
        AttackType::Sqli => RuleTemplate {
            variables: "ARGS|REQUEST_BODY",
            transformations: &["t:urlDecodeUni", "t:lowercase", "t:replaceComments"],
            severity: "CRITICAL",
            tags: &["attack-sqli"],
        },
        AttackType::GenericAttack => RuleTemplate {
            variables: "REQUEST_URI|ARGS|REQUEST_BODY",
            transformations: &["t:urlDecodeUni", "t:lowercase", "t:removeNulls"],
            severity: "ERROR",
            tags: &["attack-generic"],
        },
    }
}

pub struct RuleBuilder {
    base_rule_id: i64,
}

impl RuleBuilder {
    pub fn new(base_rule_id: i64) -> Self {
        Self { base_rule_id }
    }

    pub fn rule_id(&self, cluster_id: usize) -> i64 {
        self.base_rule_id + cluster_id as i64
    }

    pub fn build(
        &self,
        cluster_id: usize,
        label_mode: AttackLabel,
        signature: Signature,
        regex: String,
    ) -> GeneratedRule {
        let attack_type = AttackType::from(label_mode);
        let template = template_for(attack_type);
        let rule_id = self.rule_id(cluster_id);
        let msg = format!(
            "Auto-generated {} rule (cluster {}, label {})",
            attack_type, cluster_id, label_mode
        );

        let transformations = template.transformations.join(",");
        let tags = template.tags.join(",");
        let secrule_text = format_secrule(rule_id, &template, &regex, &msg);

        GeneratedRule {
            rule_id,
            cluster_id,
            attack_type,
            label_mode,
            signature,
            regex,
            variables: template.variables.to_string(),
            transformations,
            severity: template.severity.to_string(),
            tags,
            msg,
            secrule_text,
        }
    }
}

fn format_secrule(rule_id: i64, template: &RuleTemplate, regex: &str, msg: &str) -> String {
    let mut actions: Vec<String> = vec![
        format!("id:{}", rule_id),
        "phase:2".to_string(),
        "deny".to_string(),
        "log".to_string(),
        format!("msg:'{}'", msg.replace('\'', "")),
        format!("severity:{}", template.severity),
    ];
    actions.extend(template.tags.iter().map(|t| format!("tag:'{}'", t)));

    format!(
        "SecRule {} \"@rx {}\" \"{},{}\"",
        template.variables,
        regex.replace('"', "\\\""),
        template.transformations.join(","),
        actions.join(",")
    )
}
