use duplexwire_session::ProtocolVersion;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("duplexwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let protocol = ProtocolVersion::CURRENT;
    println!("name: duplexwire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: {}.{}", protocol.major, protocol.minor);
    println!(
        "target: {}",
        option_env!("DUPLEXWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: dispatch={}, cli=true",
        cfg!(feature = "dispatch")
    );

    Ok(SUCCESS)
}
