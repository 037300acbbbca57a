use std::borrow::Cow;

pub type Labels = Vec<StaticMetricLabel>;

#[derive(PartialOrd, Ord, PartialEq, Eq, Clone, Debug)]
pub struct StaticMetricLabel {
    pub key: &'static str,
    pub value: Cow<'static, str>,
}

impl StaticMetricLabel {
    pub const STATUS_ERROR: StaticMetricLabel = StaticMetricLabel {
        key: "status",
        value: Cow::Borrowed("error"),
    };
    pub const STATUS_SUCCESS: StaticMetricLabel = StaticMetricLabel {
        key: "status",
        value: Cow::Borrowed("success"),
    };

    pub fn new(key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn split_key_value(&self) -> (&str, &str) {
        (self.key, &self.value)
    }
}

pub const STATUS_LABEL: [&str; 1] = ["status"];
