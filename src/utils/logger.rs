use log::LevelFilter;

// 初始化日志（设置日志格式），verbose 时输出调试信息
pub fn init_logger(verbose: bool) -> Result<(), fern::InitError> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    fern::Dispatch
        ::new()
        .format(|out, message, record| {
            out.finish(
                format_args!(
                    "{} {:<5} {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    message
                )
            )
        })
        .level(level)
        // 第三方库的调试日志太多
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
