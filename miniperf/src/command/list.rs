use crate::cli::ListArgs;
use crate::error::{Error, Result};
use crate::linux::event_type::{
    cache_event_types, create_default_attr, hardware_event_types, is_supported_by_kernel,
    software_event_types, tracepoint_event_types, EventType,
};

fn print_category(title: &str, event_types: &[EventType]) {
    println!("List of {title}:");
    for event_type in event_types {
        let attr = create_default_attr(event_type);
        if is_supported_by_kernel(&attr) {
            println!("  {}", event_type.name);
        }
    }
    println!();
}

pub fn run(args: &ListArgs) -> Result<()> {
    let categories = if args.categories.is_empty() {
        vec!["hw".to_string(), "sw".to_string(), "cache".to_string(), "tracepoint".to_string()]
    } else {
        args.categories.clone()
    };
    for category in &categories {
        match category.as_str() {
            "hw" => print_category("hardware events", &hardware_event_types()),
            "sw" => print_category("software events", &software_event_types()),
            "cache" => print_category("hw-cache events", &cache_event_types()),
            "tracepoint" => print_category("tracepoint events", &tracepoint_event_types()),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown event type category '{other}', expected hw, sw, cache or tracepoint"
                )))
            }
        }
    }
    Ok(())
}
