use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let cargo = CargoBuilder::default().build()?;
    // vergen-gitcl 1.x: `sha(false)` = full SHA, `dirty(false)` = ignore untracked files.
    let gitcl = GitclBuilder::default()
        .branch(true)
        .sha(false)
        .dirty(false)
        .build()?;

    // Outside a git checkout the git instructions fall back to defaults,
    // which `version.rs` reports as "unknown".
    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&gitcl)?
        .emit()?;

    Ok(())
}
