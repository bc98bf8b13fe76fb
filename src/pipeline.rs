/// Batch rule generation: normalize, cluster, extract signatures, synthesize
/// regexes and build rules for one window's worth of labeled requests.
use tracing::{debug, info};

use crate::cluster_engine::ClusterEngine;
use crate::models::{AttackLabel, AttackType, LabeledRequest, RuleBatch};
use crate::normalizer::build_representation;
use crate::pipeline_config::PipelineConfig;
use crate::regex_synth::RegexSynthesizer;
use crate::rule_builder::RuleBuilder;
use crate::signature::{has_attack_primitive, SignatureExtractor};

pub struct RulePipeline {
    config: PipelineConfig,
    clusters: ClusterEngine,
    signatures: SignatureExtractor,
    regexes: RegexSynthesizer,
    builder: RuleBuilder,
}

impl RulePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            clusters: ClusterEngine::new(&config),
            signatures: SignatureExtractor::new(&config),
            regexes: RegexSynthesizer::new(&config),
            builder: RuleBuilder::new(config.base_rule_id),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, batch: &[LabeledRequest]) -> RuleBatch {
        let (Some(min_id), Some(max_id)) = (
            batch.iter().map(|r| r.session_db_id).min(),
            batch.iter().map(|r| r.session_db_id).max(),
        ) else {
            return RuleBatch::default();
        };

        let reprs: Vec<String> = batch
            .iter()
            .map(|r| build_representation(r, self.config.include_body, self.config.body_max_len))
            .collect();
        let labels: Vec<AttackLabel> = batch.iter().map(|r| r.label).collect();

        let clusters = self.clusters.cluster(&reprs, &labels);
        let mut rules = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let members: Vec<&str> = cluster.members.iter().map(|&i| reprs[i].as_str()).collect();
            let signature = self.signatures.extract(&members);

            if !has_attack_primitive(&signature) {
                debug!(
                    "Cluster {} ({} members) has no attack primitive in {:?}, skipping",
                    cluster.cluster_id,
                    members.len(),
                    signature
                );
                continue;
            }

            let attack_type = AttackType::from(cluster.label_mode);
            let Some(regex) = self.regexes.synthesize(attack_type, &signature) else {
                debug!(
                    "Cluster {} produced no usable {} regex from {:?}",
                    cluster.cluster_id, attack_type, signature
                );
                continue;
            };

            let rule = self
                .builder
                .build(cluster.cluster_id, cluster.label_mode, signature, regex);
            debug!(
                "Rule {} from cluster {} ({} members, {})",
                rule.rule_id,
                cluster.cluster_id,
                members.len(),
                rule.attack_type
            );
            rules.push(rule);
        }

        info!(
            "Generated {} rules from {} requests (session ids {}..={})",
            rules.len(),
            batch.len(),
            min_id,
            max_id
        );

        RuleBatch {
            rules,
            min_session_db_id: min_id,
            max_session_db_id: max_id,
        }
    }
}

/// One-shot convenience over [`RulePipeline`]
pub fn generate_rules(batch: &[LabeledRequest], config: &PipelineConfig) -> RuleBatch {
    RulePipeline::new(config.clone()).run(batch)
}
