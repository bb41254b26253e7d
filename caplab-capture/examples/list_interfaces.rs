//! Example: List network interfaces usable as capture sources
//!
//! Run with: cargo run --example list_interfaces

use caplab_capture::list_interfaces;

fn main() {
    println!("=== Network Interfaces ===\n");

    let interfaces = list_interfaces();
    for iface in &interfaces {
        println!("{}", iface.summary());
        if !iface.description.is_empty() {
            println!("  Description: {}", iface.description);
        }
    }

    println!("\n=== Capture-Capable Interfaces ===\n");

    for iface in interfaces.iter().filter(|i| i.is_capture_capable()) {
        println!("  {}", iface.name);
    }
}
