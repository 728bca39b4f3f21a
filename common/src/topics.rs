use crate::error::ConfigError;

pub const DEFAULT_SENSOR_TOPIC: &str = "devices/%s/sensors";
pub const DEFAULT_COMMAND_TOPIC: &str = "devices/%s/rpc";

/// Longest topic the node will render, matching the firmware's fixed buffer.
pub const TOPIC_MAX_LEN: usize = 255;

/// Render a printf-style topic template with the device id.
///
/// Supports at most one `%s` and `%%` for a literal percent sign. Any other
/// conversion, or a result longer than [`TOPIC_MAX_LEN`], is a startup error.
pub fn render_topic(template: &str, device_id: &str) -> Result<String, ConfigError> {
    if device_id.is_empty() {
        return Err(ConfigError::EmptyDeviceId);
    }

    let mut rendered = String::with_capacity(template.len() + device_id.len());
    let mut substituted = false;
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            rendered.push(ch);
            continue;
        }

        match chars.next() {
            Some('%') => rendered.push('%'),
            Some('s') if !substituted => {
                rendered.push_str(device_id);
                substituted = true;
            }
            Some('s') => return Err(ConfigError::TooManyArguments(template.to_string())),
            Some(conversion) => {
                return Err(ConfigError::UnsupportedConversion {
                    template: template.to_string(),
                    conversion,
                })
            }
            None => return Err(ConfigError::DanglingPercent(template.to_string())),
        }
    }

    if rendered.is_empty() {
        return Err(ConfigError::EmptyTopic);
    }
    if rendered.len() > TOPIC_MAX_LEN {
        return Err(ConfigError::TopicTooLong {
            len: rendered.len(),
            max: TOPIC_MAX_LEN,
        });
    }

    Ok(rendered)
}
