//! Build script for nodewall
//!
//! Embeds build-time information (git commit, build timestamp) so the agent
//! can log exactly which build is reconciling a node.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
