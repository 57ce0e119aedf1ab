const DATA_SUFFIX: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTopic<'a> {
    pub gateway_uid: &'a str,
    pub sensor_uid: &'a str,
}

/// Matches `<namespace>/<gateway_uid>/<sensor_uid>/data`.
pub fn parse_data_topic<'a>(namespace: &str, topic: &'a str) -> Option<DataTopic<'a>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != namespace || parts[3] != DATA_SUFFIX {
        return None;
    }
    if parts[1].is_empty() || parts[2].is_empty() {
        return None;
    }
    Some(DataTopic {
        gateway_uid: parts[1],
        sensor_uid: parts[2],
    })
}

pub fn subscription_filter(namespace: &str) -> String {
    format!("{namespace}/+/+/{DATA_SUFFIX}")
}
