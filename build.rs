use std::error::Error;

use vergen::{BuildBuilder, Emitter, RustcBuilder};
use vergen_git2::Git2Builder;

fn main() -> Result<(), Box<dyn Error>> {
    // Build metadata surfaces in logs and the handshake software_version.
    let build = BuildBuilder::all_build()?;
    let rustc = RustcBuilder::all_rustc()?;
    let git = Git2Builder::all_git()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&rustc)?
        .add_instructions(&git)?
        .emit()?;

    Ok(())
}
