use serde::{Deserialize, Serialize};

/// API usage information from the LLM provider.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Cost in USD when the provider reports one (`total_cost` on some gateways).
    #[serde(default, alias = "total_cost", skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when the provider did not send one. Never estimated.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

/// Merge two optional `Usage` values, summing their token counts and costs.
pub fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
            cost: match (p.cost, s.cost) {
                (Some(pc), Some(sc)) => Some(pc + sc),
                (Some(pc), None) => Some(pc),
                (None, Some(sc)) => Some(sc),
                (None, None) => None,
            },
        }),
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32, cost: Option<f64>) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cost,
        }
    }

    #[test]
    fn test_usage_returns_zero_when_no_cost() {
        assert_eq!(usage(10, 5, None).cost(), 0.0);
        assert_eq!(usage(10, 5, Some(0.05)).cost(), 0.05);
    }

    #[test]
    fn test_usage_deserialize_with_total_cost() {
        let json = r#"{"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150, "total_cost": 0.0025}"#;
        let parsed: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.total_tokens, 150);
        assert_eq!(parsed.cost(), 0.0025);
    }

    #[test]
    fn test_merge_usage_sums_tokens_and_known_costs() {
        let merged = merge_usage(Some(usage(10, 5, Some(0.5))), Some(usage(1, 2, None))).unwrap();
        assert_eq!(merged.prompt_tokens, 11);
        assert_eq!(merged.completion_tokens, 7);
        assert_eq!(merged.total_tokens, 18);
        assert_eq!(merged.cost, Some(0.5));
        assert_eq!(merge_usage(None, None), None);
        assert_eq!(merge_usage(None, Some(usage(1, 1, None))), Some(usage(1, 1, None)));
    }
}
